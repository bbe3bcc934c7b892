use ctf_ir::clock::ClockClass;
use ctf_ir::decl::Declaration;
use ctf_ir::io::writer::Writer;
use ctf_ir::io::EventFields;
use ctf_ir::ir::{EventClass, StreamClass, TraceClass};
use ctf_ir::value::Value;
use ctf_ir::{Position, Reader};
use internment::Intern;
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

/// A single stream, two payload-less event classes (`init`, `shutdown`),
/// one packet. The smallest trace that still exercises a clock-mapped
/// timestamp end to end.
fn write_simple_trace(dir: &std::path::Path) {
    let mut trace = TraceClass::new_with_defaults();

    let clock = ClockClass::new("timer");
    clock.set_frequency(1_000_000_000).unwrap();

    let mut stream = StreamClass::new_with_defaults("stream_a", Some(clock));

    let mut init = EventClass::new("init");
    init.set_payload_decl(Declaration::new_struct()).unwrap();
    stream.add_event_class(init).unwrap();

    let mut shutdown = EventClass::new("shutdown");
    shutdown.set_payload_decl(Declaration::new_struct()).unwrap();
    stream.add_event_class(shutdown).unwrap();

    trace.add_stream_class(stream).unwrap();

    let mut writer = Writer::new(dir, trace).unwrap();

    {
        let stream_class = writer.trace().stream_class(0).unwrap();
        let class = stream_class.event_classes().iter().find(|e| e.name().as_str() == "init").unwrap();
        let id = class.id().unwrap();
        let fields = EventFields::new(stream_class, class);
        writer.append_event(0, id, fields, Some(0)).unwrap();
    }

    {
        let stream_class = writer.trace().stream_class(0).unwrap();
        let class = stream_class.event_classes().iter().find(|e| e.name().as_str() == "shutdown").unwrap();
        let id = class.id().unwrap();
        let fields = EventFields::new(stream_class, class);
        writer.append_event(0, id, fields, Some(1)).unwrap();
    }

    writer.close().unwrap();
}

#[test]
fn simple_trace_sync() {
    let dir = temp_dir("simple-sync");
    write_simple_trace(&dir);

    let reader = Reader::open(&dir).unwrap();
    let mut iter = reader.create_iterator(Position::Begin, Position::End).unwrap();

    let (stream_id, init) = iter.next().unwrap();
    assert_eq!(stream_id, 0);
    assert_eq!(init.class_name, Intern::new("init".to_owned()));
    assert_eq!(init.payload, Some(Value::Struct(vec![])));

    let (stream_id, shutdown) = iter.next().unwrap();
    assert_eq!(stream_id, 0);
    assert_eq!(shutdown.class_name, Intern::new("shutdown".to_owned()));
    assert_eq!(shutdown.timestamp, Some(1));

    assert!(iter.next().is_none());

    std::fs::remove_dir_all(&dir).ok();
}

#[test(tokio::test)]
async fn simple_trace_async() {
    let dir = temp_dir("simple-async");
    write_simple_trace(&dir);

    let reader = Reader::open(&dir).unwrap();
    let decoder = reader.into_packet_decoder();
    let file = tokio::fs::File::open(dir.join("stream_0")).await.unwrap();
    let mut framed = FramedRead::new(file, decoder);

    let packet = framed.next().await.unwrap().unwrap();
    assert_eq!(packet.events.len(), 2);
    assert_eq!(packet.events[0].1.class_name, Intern::new("init".to_owned()));
    assert_eq!(packet.events[1].1.class_name, Intern::new("shutdown".to_owned()));

    assert!(framed.next().await.is_none());

    std::fs::remove_dir_all(&dir).ok();
}
