use ctf_ir::clock::ClockClass;
use ctf_ir::decl::{ByteOrder, Declaration, Encoding, PreferredDisplayBase};
use ctf_ir::io::writer::Writer;
use ctf_ir::io::EventFields;
use ctf_ir::ir::{EventClass, StreamClass, TraceClass};
use ctf_ir::value::Value;
use ctf_ir::{Position, Reader};
use pretty_assertions::assert_eq;
use std::path::PathBuf;
use test_log::test;
use tokio_stream::StreamExt;
use tokio_util::codec::FramedRead;

fn temp_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("ctf-ir-test-{name}-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    dir
}

fn u32_decl() -> Declaration {
    Declaration::new_uint(32, ByteOrder::Little, PreferredDisplayBase::Decimal, 32).unwrap()
}

/// Builds a trace with one stream carrying a clock-mapped timestamp, an
/// enum payload field, and an event class with a dynamic array payload, and
/// writes six events across packets small enough to force at least one
/// split, then reads the whole trace back through both the eager
/// [`Reader::read_all`] path and the streaming [`ctf_ir::io::reader::PacketDecoder`].
fn build_trace() -> (TraceClass, ClockClass) {
    let mut trace = TraceClass::new_with_defaults();

    let clock = ClockClass::new("timer");
    clock.set_frequency(1_000_000_000).unwrap();

    let mut stream = StreamClass::new_with_defaults("events", Some(clock.clone()));

    let mut init = EventClass::new("init");
    let init_payload = Declaration::new_struct();
    init_payload
        .append_member("version", Declaration::new_string(Encoding::Utf8))
        .unwrap();
    init.set_payload_decl(init_payload).unwrap();
    stream.add_event_class(init).unwrap();

    let mut counted = EventClass::new("counted");
    let counted_payload = Declaration::new_struct();
    counted_payload.append_member("len", u32_decl()).unwrap();
    counted_payload
        .append_member("data", Declaration::new_dyn_array(u32_decl(), "len"))
        .unwrap();
    counted.set_payload_decl(counted_payload).unwrap();
    stream.add_event_class(counted).unwrap();

    let mut shutdown = EventClass::new("shutdown");
    shutdown.set_payload_decl(Declaration::new_struct()).unwrap();
    stream.add_event_class(shutdown).unwrap();

    trace.add_stream_class(stream).unwrap();
    (trace, clock)
}

fn write_events(dir: &std::path::Path) {
    let (trace, _clock) = build_trace();
    let mut writer = Writer::new(dir, trace).unwrap();
    // Small enough that the four `counted` events (each a handful of u32s)
    // force at least one packet split.
    writer.set_packet_size_bits(2048);

    {
        let stream_class = writer.trace().stream_class(0).unwrap();
        let class = stream_class.event_classes().iter().find(|e| e.name().as_str() == "init").unwrap();
        let id = class.id().unwrap();
        let fields = EventFields::new(stream_class, class);
        fields.payload.as_ref().unwrap().with_member("version", |m| m.set_str("1.0.0")).unwrap().unwrap();
        writer.append_event(0, id, fields, Some(0)).unwrap();
    }

    for i in 0..4u64 {
        let stream_class = writer.trace().stream_class(0).unwrap();
        let class = stream_class.event_classes().iter().find(|e| e.name().as_str() == "counted").unwrap();
        let id = class.id().unwrap();
        let fields = EventFields::new(stream_class, class);
        let payload = fields.payload.as_ref().unwrap();
        payload.with_member("len", |m| m.set_uint(3)).unwrap().unwrap();
        payload
            .with_member("data", |m| {
                m.push_element(i as u32).unwrap();
                m.push_element(i as u32 + 1).unwrap();
                m.push_element(i as u32 + 2).unwrap();
            })
            .unwrap();
        writer.append_event(0, id, fields, Some(i + 1)).unwrap();
    }

    {
        let stream_class = writer.trace().stream_class(0).unwrap();
        let class = stream_class.event_classes().iter().find(|e| e.name().as_str() == "shutdown").unwrap();
        let id = class.id().unwrap();
        let fields = EventFields::new(stream_class, class);
        writer.append_event(0, id, fields, Some(5)).unwrap();
    }

    writer.close().unwrap();
}

#[test]
fn round_trips_through_the_sync_reader() {
    let dir = temp_dir("full-sync");
    write_events(&dir);

    let reader = Reader::open(&dir).unwrap();
    let mut iter = reader.create_iterator(Position::Begin, Position::End).unwrap();

    let (_, init) = iter.next().unwrap();
    assert_eq!(init.class_name.as_str(), "init");
    assert_eq!(
        init.payload,
        Some(Value::Struct(vec![(internment::Intern::new("version".to_owned()), Value::String("1.0.0".to_owned()))]))
    );

    for i in 0..4u32 {
        let (_, ev) = iter.next().unwrap();
        assert_eq!(ev.class_name.as_str(), "counted");
        let data = ev.payload.as_ref().unwrap().as_struct_members().unwrap()[1].1.as_array().unwrap().to_vec();
        assert_eq!(data, vec![Value::from(i), Value::from(i + 1), Value::from(i + 2)]);
    }

    let (_, shutdown) = iter.next().unwrap();
    assert_eq!(shutdown.class_name.as_str(), "shutdown");
    assert!(iter.next().is_none());

    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn packetized_metadata_round_trips() {
    let dir = temp_dir("full-packetized-metadata");
    let (trace, _clock) = build_trace();
    let mut writer = Writer::new(&dir, trace).unwrap();
    writer.set_packetize_metadata(true);
    writer.close().unwrap();

    let raw = std::fs::read(dir.join("metadata")).unwrap();
    assert_eq!(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]), 0x75D1_1D57);

    let reader = Reader::open(&dir).unwrap();
    assert_eq!(reader.trace().stream_classes().len(), 1);

    std::fs::remove_dir_all(&dir).ok();
}

#[test(tokio::test)]
async fn round_trips_through_the_packet_decoder() {
    let dir = temp_dir("full-async");
    write_events(&dir);

    let reader = Reader::open(&dir).unwrap();
    let decoder = reader.into_packet_decoder();
    let file = tokio::fs::File::open(dir.join("stream_0")).await.unwrap();
    let mut framed = FramedRead::new(file, decoder);

    let mut seen = Vec::new();
    while let Some(packet) = framed.next().await {
        let packet = packet.unwrap();
        for (_, event) in packet.events {
            seen.push(event.class_name.as_str().to_owned());
        }
    }

    assert_eq!(seen, vec!["init", "counted", "counted", "counted", "counted", "shutdown"]);
    std::fs::remove_dir_all(&dir).ok();
}
