//! Clock classes and snapshots.
//!
//! A [`ClockClass`] is a small, frozen-on-attachment, reference-counted
//! record (an `Arc`, same shape as [`crate::decl::Declaration`]) with the
//! usual setter-rejects-after-freeze pattern. The per-process clock-class
//! registry is a `OnceLock`-backed `Mutex<FxHashMap<Uuid, ClockClass>>`,
//! constructed on first use.

use crate::error::Error;
use fxhash::FxHashMap;
use internment::Intern;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use uuid::Uuid;

struct ClockClassInner {
    name: Intern<String>,
    description: Mutex<Option<String>>,
    /// Ticks per second. Defaults to 10^9 (nanosecond clock).
    frequency: AtomicU64,
    precision: AtomicU64,
    offset_seconds: AtomicI64,
    offset_cycles: AtomicU64,
    origin_is_unix_epoch: AtomicBool,
    uuid: Mutex<Option<Uuid>>,
    frozen: AtomicBool,
}

/// {name, description, frequency, precision, offset, origin flag, UUID}
/// Cheap to clone (an `Arc` bump); shared the same way a
/// [`crate::decl::Declaration`] is once frozen.
#[derive(Clone)]
pub struct ClockClass(Arc<ClockClassInner>);

impl PartialEq for ClockClass {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for ClockClass {}

impl ClockClass {
    pub fn new(name: impl Into<String>) -> Self {
        ClockClass(Arc::new(ClockClassInner {
            name: Intern::new(name.into()),
            description: Mutex::new(None),
            frequency: AtomicU64::new(1_000_000_000),
            precision: AtomicU64::new(1),
            offset_seconds: AtomicI64::new(0),
            offset_cycles: AtomicU64::new(0),
            origin_is_unix_epoch: AtomicBool::new(false),
            uuid: Mutex::new(None),
            frozen: AtomicBool::new(false),
        }))
    }

    pub fn name(&self) -> Intern<String> {
        self.0.name
    }

    pub fn is_frozen(&self) -> bool {
        self.0.frozen.load(Ordering::Acquire)
    }

    pub fn freeze(&self) {
        self.0.frozen.store(true, Ordering::Release);
    }

    fn check_mutable(&self) -> Result<(), Error> {
        if self.is_frozen() {
            Err(Error::Frozen)
        } else {
            Ok(())
        }
    }

    pub fn set_description(&self, description: impl Into<String>) -> Result<(), Error> {
        self.check_mutable()?;
        *self.0.description.lock().unwrap() = Some(description.into());
        Ok(())
    }

    pub fn description(&self) -> Option<String> {
        self.0.description.lock().unwrap().clone()
    }

    pub fn set_frequency(&self, hz: u64) -> Result<(), Error> {
        self.check_mutable()?;
        if hz == 0 {
            return Err(Error::invalid("clock frequency must be nonzero"));
        }
        self.0.frequency.store(hz, Ordering::Release);
        Ok(())
    }

    pub fn frequency(&self) -> u64 {
        self.0.frequency.load(Ordering::Acquire)
    }

    pub fn set_precision(&self, precision: u64) -> Result<(), Error> {
        self.check_mutable()?;
        self.0.precision.store(precision, Ordering::Release);
        Ok(())
    }

    pub fn precision(&self) -> u64 {
        self.0.precision.load(Ordering::Acquire)
    }

    pub fn set_offset(&self, seconds: i64, cycles: u64) -> Result<(), Error> {
        self.check_mutable()?;
        self.0.offset_seconds.store(seconds, Ordering::Release);
        self.0.offset_cycles.store(cycles, Ordering::Release);
        Ok(())
    }

    pub fn offset(&self) -> (i64, u64) {
        (self.0.offset_seconds.load(Ordering::Acquire), self.0.offset_cycles.load(Ordering::Acquire))
    }

    pub fn set_origin_is_unix_epoch(&self, is_unix_epoch: bool) -> Result<(), Error> {
        self.check_mutable()?;
        self.0.origin_is_unix_epoch.store(is_unix_epoch, Ordering::Release);
        Ok(())
    }

    pub fn origin_is_unix_epoch(&self) -> bool {
        self.0.origin_is_unix_epoch.load(Ordering::Acquire)
    }

    pub fn set_uuid(&self, uuid: Uuid) -> Result<(), Error> {
        self.check_mutable()?;
        *self.0.uuid.lock().unwrap() = Some(uuid);
        Ok(())
    }

    pub fn uuid(&self) -> Option<Uuid> {
        *self.0.uuid.lock().unwrap()
    }

    /// `offset_seconds*10^9 + ns(frequency, offset_cycles) + ns(frequency, raw)`,
    /// where `ns(f, x) = x` when `f == 10^9` else `floor(10^9 * x / f)`.
    ///
    /// The choice of integer vs. double arithmetic when
    /// `frequency != 10^9`) is resolved here as exact integer division with a
    /// `u128` intermediate, so the result never drifts with platform float
    /// rounding and never overflows for `frequency` near 1 and `raw` near
    /// `u64::MAX` (documented in DESIGN.md).
    pub fn to_ns_from_origin(&self, raw: u64) -> i128 {
        let freq = self.frequency();
        let (offset_seconds, offset_cycles) = self.offset();
        let ns = |x: u64| -> u128 {
            if freq == 1_000_000_000 {
                x as u128
            } else {
                (1_000_000_000u128 * x as u128) / freq as u128
            }
        };
        offset_seconds as i128 * 1_000_000_000i128 + ns(offset_cycles) as i128 + ns(raw) as i128
    }
}

/// An instant materialized as (clock class, raw tick count), matching the
/// GLOSSARY.
#[derive(Clone)]
pub struct ClockSnapshot {
    pub clock_class: ClockClass,
    pub raw: u64,
}

impl ClockSnapshot {
    pub fn to_ns_from_origin(&self) -> i128 {
        self.clock_class.to_ns_from_origin(self.raw)
    }
}

/// Per-stream clock state machine: `Unset -> Running(last)`,
/// every `set_value` requiring `v' >= last`. Kept outside [`ClockClass`]
/// (clocks are shared read fixtures once frozen; monotonicity is a property
/// of one stream's sequence of appended events, not of the clock class
/// itself, since nothing stops two streams sharing a clock class from
/// observing interleaved raw values).
#[derive(Default)]
pub struct MonotonicClock {
    last: Option<u64>,
}

impl MonotonicClock {
    pub fn set_value(&mut self, clock_name: &str, value: u64) -> Result<(), Error> {
        if let Some(last) = self.last {
            if value < last {
                return Err(Error::ClockNonMonotonic {
                    clock: clock_name.to_owned(),
                    previous: last,
                    attempted: value,
                });
            }
        }
        self.last = Some(value);
        Ok(())
    }

    pub fn last_value(&self) -> Option<u64> {
        self.last
    }
}

static REGISTRY: OnceLock<Mutex<FxHashMap<Uuid, ClockClass>>> = OnceLock::new();

fn registry() -> &'static Mutex<FxHashMap<Uuid, ClockClass>> {
    REGISTRY.get_or_init(|| Mutex::new(FxHashMap::default()))
}

/// Registers `class` under its UUID in the process-wide registry.
/// Re-registering the same `ClockClass` (by `Arc` identity) under the
/// same UUID is a no-op; registering a *different* class under a UUID
/// already claimed by another is `invalid_argument`.
pub fn register(class: ClockClass) -> Result<(), Error> {
    let uuid = class
        .uuid()
        .ok_or_else(|| Error::invalid("clock class must have a UUID to register"))?;
    let mut reg = registry().lock().unwrap();
    match reg.get(&uuid) {
        Some(existing) if *existing == class => Ok(()),
        Some(_) => Err(Error::invalid(format!("clock UUID {uuid} is already registered to a different clock class"))),
        None => {
            reg.insert(uuid, class);
            Ok(())
        }
    }
}

pub fn lookup(uuid: &Uuid) -> Option<ClockClass> {
    registry().lock().unwrap().get(uuid).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ns_from_origin_matches_spec_scenario_5() {
        let clock = ClockClass::new("c");
        clock.set_frequency(1000).unwrap();
        clock.set_offset(10, 500).unwrap();
        clock.set_origin_is_unix_epoch(true).unwrap();
        assert_eq!(clock.to_ns_from_origin(1000), 11_500_000_000);
    }

    #[test]
    fn setters_reject_after_freeze() {
        let clock = ClockClass::new("c");
        clock.freeze();
        assert!(matches!(clock.set_frequency(2000), Err(Error::Frozen)));
    }

    #[test]
    fn monotonic_clock_rejects_decrease() {
        let mut clock = MonotonicClock::default();
        clock.set_value("c", 5).unwrap();
        clock.set_value("c", 7).unwrap();
        assert!(matches!(clock.set_value("c", 6), Err(Error::ClockNonMonotonic { .. })));
    }

    #[test]
    fn registry_rejects_uuid_collision_with_different_class() {
        let uuid = Uuid::new_v4();
        let a = ClockClass::new("a");
        a.set_uuid(uuid).unwrap();
        let b = ClockClass::new("b");
        b.set_uuid(uuid).unwrap();
        register(a.clone()).unwrap();
        assert!(register(b).is_err());
        assert!(register(a).is_ok());
    }
}
