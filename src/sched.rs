//! Time-ordered scheduler for one-shot and periodic events.
//!
//! Events are keyed by a monotonic fire time; equal fire times pop in
//! insertion order. The reactor derives its ppoll timeout from
//! `next_interval` and, on expiry, drains `pop` until it returns `None`.
//!
//! Payloads are `Rc<dyn Any>`: shared with whatever copy of the event `pop`
//! hands back, dropped (and thereby released) when the last holder goes
//! away. `Rc::ptr_eq` on the payload doubles as event identity for removal.

use std::any::Any;
use std::cmp::Ordering;
use std::fmt;
use std::rc::Rc;

use crate::error::{Error, Result};
use crate::sorted::SortedList;
use crate::timespec::TimeSpec;

/// Remaining firings of a periodic event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cycles {
    Finite(u32),
    Infinite,
}

/// A scheduled (or not-yet-scheduled) future event.
///
/// `Clone` is shallow: the payload `Rc` is shared. `pop` returns such a
/// shallow copy when it re-arms a periodic event, with `busy` telling the
/// caller the scheduler still owns a live instance.
#[derive(Clone)]
pub struct Event {
    id: u32,
    payload: Rc<dyn Any>,
    fire_at: TimeSpec,
    period: Option<TimeSpec>,
    cycles: Cycles,
    busy: bool,
}

impl Event {
    /// A fresh unscheduled event firing "now" until `set_time` says
    /// otherwise.
    pub fn new(id: u32, payload: Rc<dyn Any>) -> Event {
        Event {
            id,
            payload,
            fire_at: TimeSpec::now_monotonic(),
            period: None,
            cycles: Cycles::Finite(1),
            busy: false,
        }
    }

    /// Absolute monotonic fire time; `None` means "now".
    pub fn set_time(&mut self, at: Option<TimeSpec>) {
        self.fire_at = at.unwrap_or_else(TimeSpec::now_monotonic);
    }

    /// Mark periodic. A zero period or zero cycle count is unusable.
    pub fn set_periodic(&mut self, period: TimeSpec, cycles: Cycles) -> Result<()> {
        if period == TimeSpec::ZERO {
            return Err(Error::InvalidArgument("zero period"));
        }
        if cycles == Cycles::Finite(0) {
            return Err(Error::InvalidArgument("zero cycles"));
        }
        self.period = Some(period);
        self.cycles = cycles;
        Ok(())
    }

    /// Non-negative interval until the fire time; zero if already due.
    pub fn time_left(&self) -> TimeSpec {
        self.fire_at.saturating_sub(TimeSpec::now_monotonic())
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn payload(&self) -> &Rc<dyn Any> {
        &self.payload
    }

    pub fn fire_at(&self) -> TimeSpec {
        self.fire_at
    }

    pub fn period(&self) -> Option<TimeSpec> {
        self.period
    }

    pub fn cycles(&self) -> Cycles {
        self.cycles
    }

    /// True while a scheduler owns a live instance of this event.
    pub fn busy(&self) -> bool {
        self.busy
    }

    fn same_identity(&self, other: &Event) -> bool {
        self.id == other.id && Rc::ptr_eq(&self.payload, &other.payload)
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("id", &self.id)
            .field("fire_at", &self.fire_at)
            .field("period", &self.period)
            .field("cycles", &self.cycles)
            .field("busy", &self.busy)
            .finish()
    }
}

/// Ordered set of future events, earliest first.
#[derive(Debug, Default)]
pub struct Scheduler {
    events: SortedList<Event>,
}

impl Scheduler {
    pub fn new() -> Scheduler {
        Scheduler { events: SortedList::new() }
    }

    fn by_fire_time(a: &Event, b: &Event) -> Ordering {
        a.fire_at.cmp(&b.fire_at)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Take ownership of an event. An event already owned by a scheduler is
    /// refused, so one event cannot sit in two queues.
    pub fn insert(&mut self, mut ev: Event) -> Result<()> {
        if ev.busy {
            return Err(Error::Busy("event already scheduled"));
        }
        ev.busy = true;
        self.events.insert_sorted_by(ev, Self::by_fire_time);
        Ok(())
    }

    /// Insert a freshly built event and hand back a shallow copy of its
    /// scheduled state, usable as a removal handle.
    fn arm(&mut self, mut ev: Event) -> Event {
        ev.busy = true;
        let handle = ev.clone();
        self.events.insert_sorted_by(ev, Self::by_fire_time);
        handle
    }

    /// One-shot at an absolute time (`None` = now).
    pub fn schedule_once(&mut self, at: Option<TimeSpec>, id: u32, payload: Rc<dyn Any>) -> Result<Event> {
        let mut ev = Event::new(id, payload);
        ev.set_time(at);
        Ok(self.arm(ev))
    }

    /// One-shot after a relative interval.
    pub fn schedule_once_delayed(&mut self, interval: TimeSpec, id: u32, payload: Rc<dyn Any>) -> Result<Event> {
        let at = TimeSpec::now_monotonic().checked_add(interval);
        self.schedule_once(Some(at), id, payload)
    }

    /// Periodic with a first firing at `at` (`None` = now).
    pub fn schedule_periodic(
        &mut self,
        at: Option<TimeSpec>,
        id: u32,
        payload: Rc<dyn Any>,
        period: TimeSpec,
        cycles: Cycles,
    ) -> Result<Event> {
        let mut ev = Event::new(id, payload);
        ev.set_periodic(period, cycles)?;
        ev.set_time(at);
        Ok(self.arm(ev))
    }

    /// Periodic with the first firing one period from now.
    pub fn schedule_periodic_delayed(
        &mut self,
        id: u32,
        payload: Rc<dyn Any>,
        period: TimeSpec,
        cycles: Cycles,
    ) -> Result<Event> {
        let at = TimeSpec::now_monotonic().checked_add(period);
        self.schedule_periodic(Some(at), id, payload, period, cycles)
    }

    /// Interval until the earliest event, clamped at zero. `None` when the
    /// set is empty.
    pub fn next_interval(&self) -> Option<TimeSpec> {
        self.events.first().map(Event::time_left)
    }

    /// Remove and return the earliest event if it is due; `None` otherwise.
    ///
    /// A periodic event with firings left is advanced by its period and
    /// re-inserted; the returned copy then carries `busy == true`.
    pub fn pop(&mut self) -> Option<Event> {
        let now = TimeSpec::now_monotonic();
        if !self.events.first()?.fire_at.is_past(now) {
            return None;
        }
        let mut ev = self.events.pop_first()?;
        ev.busy = false;
        if let Some(period) = ev.period {
            let remaining = match ev.cycles {
                Cycles::Infinite => true,
                Cycles::Finite(n) => n > 1,
            };
            if remaining {
                // Cadence anchors on the scheduled time, not on when the
                // caller got around to popping.
                ev.fire_at = ev.fire_at.checked_add(period);
                if let Cycles::Finite(n) = ev.cycles {
                    ev.cycles = Cycles::Finite(n - 1);
                }
                ev.busy = true;
                self.events.insert_sorted_by(ev.clone(), Self::by_fire_time);
            }
        }
        Some(ev)
    }

    /// Remove every instance matching `ev`'s identity (id + payload).
    pub fn remove_event(&mut self, ev: &Event) -> usize {
        self.events.remove_where(|e| e.same_identity(ev))
    }

    /// Remove every event with the given id.
    pub fn remove_by_id(&mut self, id: u32) -> usize {
        self.events.remove_where(|e| e.id == id)
    }

    /// Remove every event carrying exactly this payload allocation.
    pub fn remove_by_payload(&mut self, payload: &Rc<dyn Any>) -> usize {
        self.events.remove_where(|e| Rc::ptr_eq(&e.payload, payload))
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;
    use std::time::Duration;

    fn ms(n: i64) -> TimeSpec {
        TimeSpec::new(0, n * 1_000_000)
    }

    #[test]
    fn test_one_shot_fires_after_delay() {
        let mut sched = Scheduler::new();
        let handle = sched.schedule_once_delayed(ms(500), 78, Rc::new("test")).unwrap();

        assert!(sched.pop().is_none());
        let left = sched.next_interval().unwrap();
        assert!(left > TimeSpec::ZERO);
        assert!(left <= ms(500));
        assert!(handle.time_left() <= left);

        sleep(Duration::from_millis(510));
        let ev = sched.pop().expect("event is due");
        assert_eq!(ev.id(), 78);
        assert_eq!(ev.payload().downcast_ref::<&str>(), Some(&"test"));
        assert!(!ev.busy());
        assert!(sched.is_empty());
        assert!(sched.next_interval().is_none());
    }

    #[test]
    fn test_periodic_two_cycles() {
        let mut sched = Scheduler::new();
        sched
            .schedule_periodic_delayed(5, Rc::new(()), ms(100), Cycles::Finite(2))
            .unwrap();

        assert!(sched.pop().is_none());

        sleep(Duration::from_millis(110));
        let first = sched.pop().expect("first firing");
        assert_eq!(first.id(), 5);
        assert!(first.busy(), "one cycle left, still owned by the scheduler");
        assert_eq!(first.cycles(), Cycles::Finite(1));
        assert!(sched.pop().is_none(), "second firing is a period away");

        sleep(Duration::from_millis(110));
        let second = sched.pop().expect("second firing");
        assert!(!second.busy(), "cycles exhausted");
        assert!(sched.pop().is_none());
        assert!(sched.is_empty());
    }

    #[test]
    fn test_periodic_cadence_anchors_on_schedule_time() {
        let mut sched = Scheduler::new();
        let t0 = TimeSpec::now_monotonic();
        sched
            .schedule_periodic(Some(t0), 9, Rc::new(()), ms(250), Cycles::Finite(3))
            .unwrap();

        let first = sched.pop().expect("due immediately");
        assert_eq!(first.fire_at(), t0.checked_add(ms(250)));

        // Popping late must not slide the cadence.
        sleep(Duration::from_millis(260));
        let second = sched.pop().expect("second firing");
        assert_eq!(second.fire_at(), t0.checked_add(ms(500)));
    }

    #[test]
    fn test_zero_cycles_and_zero_period_rejected() {
        let mut ev = Event::new(1, Rc::new(()));
        assert!(matches!(
            ev.set_periodic(ms(100), Cycles::Finite(0)),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            ev.set_periodic(TimeSpec::ZERO, Cycles::Finite(3)),
            Err(Error::InvalidArgument(_))
        ));
        // Failed configuration leaves the event one-shot.
        assert!(ev.period().is_none());
    }

    #[test]
    fn test_equal_fire_times_pop_in_insertion_order() {
        let mut sched = Scheduler::new();
        let at = TimeSpec::now_monotonic();
        for id in [10u32, 11, 12] {
            sched.schedule_once(Some(at), id, Rc::new(())).unwrap();
        }
        assert_eq!(sched.pop().unwrap().id(), 10);
        assert_eq!(sched.pop().unwrap().id(), 11);
        assert_eq!(sched.pop().unwrap().id(), 12);
    }

    #[test]
    fn test_remove_by_id_and_payload() {
        let mut sched = Scheduler::new();
        let later = TimeSpec::now_monotonic().checked_add(ms(10_000));
        let payload: Rc<dyn Any> = Rc::new(42u32);
        sched.schedule_once(Some(later), 1, payload.clone()).unwrap();
        sched.schedule_once(Some(later), 1, Rc::new(())).unwrap();
        sched.schedule_once(Some(later), 2, payload.clone()).unwrap();

        assert_eq!(sched.remove_by_id(1), 2);
        assert_eq!(sched.remove_by_payload(&payload), 1);
        assert!(sched.is_empty());
    }

    #[test]
    fn test_remove_by_event_handle() {
        let mut sched = Scheduler::new();
        let later = TimeSpec::now_monotonic().checked_add(ms(10_000));
        let handle = sched.schedule_once(Some(later), 7, Rc::new(())).unwrap();
        sched.schedule_once(Some(later), 7, Rc::new(())).unwrap();

        // Identity is id + payload allocation, so only one instance matches.
        assert_eq!(sched.remove_event(&handle), 1);
        assert_eq!(sched.len(), 1);
    }

    #[test]
    fn test_busy_event_refused_twice() {
        let mut sched = Scheduler::new();
        let handle = sched.schedule_once(None, 3, Rc::new(())).unwrap();
        assert!(handle.busy());
        assert!(matches!(sched.insert(handle), Err(Error::Busy(_))));
    }

    #[test]
    fn test_pop_never_returns_future_event() {
        let mut sched = Scheduler::new();
        sched.schedule_once_delayed(ms(60_000), 1, Rc::new(())).unwrap();
        assert!(sched.pop().is_none());
        assert_eq!(sched.len(), 1);
    }
}
