use std::{
    io,
    sync::{
        atomic::{AtomicBool, AtomicU8, Ordering},
        Arc, Mutex, MutexGuard, TryLockError,
    },
    thread,
    time::{Duration, Instant},
};

use crate::{
    clock::Clock,
    constants::{
        DISPLAY_DELAY_NORMAL, DISPLAY_DELAY_POWER_SAVE, LOCK_TIMEOUT, NETWORK_DELAY_NORMAL,
        NETWORK_DELAY_POWER_SAVE, TASK_STACK_SIZE, WAKE_PINS,
    },
    services::{ConnectivityServices, Subsystem},
    sleep::{PowerTransition, SleepMonitor},
    types::{ConnectivityStatus, LoopKind, PowerState},
};

/// The external renderer and touch decoder.
pub trait UiSurface: Send {
    fn update(&mut self, status: &ConnectivityStatus);
    /// True once per touch or press since the previous call.
    fn has_new_event(&mut self) -> bool;
    fn set_backlight(&mut self, on: bool);
    fn power_down(&mut self);
}

/// Consumer of the inbound slots.
pub trait CommandInterpreter: Send {
    fn update(&mut self, services: &mut ConnectivityServices, now_ms: u64);
}

/// Platform hooks for task placement, priorities and the final halt.
pub trait PowerControl: Send + Sync {
    /// Called on the spawning thread just before a loop thread is created.
    fn prepare_spawn(&self, _kind: LoopKind) {}
    /// Called from inside each loop thread once it starts.
    fn register_loop(&self, _kind: LoopKind) {}
    fn set_power_save(&self, enabled: bool);
    /// Arms the wake pins and halts. Returns only on platforms that cannot
    /// halt; the loops stop either way.
    fn enter_deep_sleep(&self, wake_pins: &[i32]);
}

pub struct SharedContext {
    pub services: ConnectivityServices,
    pub ui: Box<dyn UiSurface>,
    pub interpreter: Box<dyn CommandInterpreter>,
}

/// Polls `try_lock` until `timeout` passes. Never blocks indefinitely.
pub fn lock_within<T>(mutex: &Mutex<T>, timeout: Duration) -> Option<MutexGuard<'_, T>> {
    let start = Instant::now();
    loop {
        match mutex.try_lock() {
            Ok(guard) => return Some(guard),
            Err(TryLockError::Poisoned(poisoned)) => return Some(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => {
                if start.elapsed() >= timeout {
                    return None;
                }
                thread::sleep(Duration::from_millis(1));
            }
        }
    }
}

/// Index-based dispatcher over [`Subsystem::ORDER`].
#[derive(Debug, Default, Clone)]
pub struct RoundRobin {
    next: usize,
}

impl RoundRobin {
    pub fn next_subsystem(&mut self) -> Subsystem {
        let subsystem = Subsystem::ORDER[self.next];
        self.next = (self.next + 1) % Subsystem::ORDER.len();
        subsystem
    }
}

/// Current power state plus the platform control, shared by both loops.
#[derive(Clone)]
pub struct PowerManager {
    state: Arc<AtomicU8>,
    sleep_requested: Arc<AtomicBool>,
    control: Arc<dyn PowerControl>,
}

impl PowerManager {
    pub fn new(control: Arc<dyn PowerControl>) -> Self {
        Self {
            state: Arc::new(AtomicU8::new(PowerState::Normal.to_u8())),
            sleep_requested: Arc::new(AtomicBool::new(false)),
            control,
        }
    }

    pub fn state(&self) -> PowerState {
        PowerState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: PowerState) {
        self.state.store(state.to_u8(), Ordering::Release);
    }

    /// Asks the display loop to enter deep sleep on its next cycle.
    pub fn request_deep_sleep(&self) {
        self.sleep_requested.store(true, Ordering::Release);
    }

    fn take_sleep_request(&self) -> bool {
        self.sleep_requested.swap(false, Ordering::AcqRel)
    }

    pub fn loop_delay(&self, kind: LoopKind) -> Duration {
        let saving = self.state() == PowerState::PowerSave;
        match (kind, saving) {
            (LoopKind::Display, false) => DISPLAY_DELAY_NORMAL,
            (LoopKind::Display, true) => DISPLAY_DELAY_POWER_SAVE,
            (LoopKind::Network, false) => NETWORK_DELAY_NORMAL,
            (LoopKind::Network, true) => NETWORK_DELAY_POWER_SAVE,
        }
    }

    pub fn apply(&self, transition: PowerTransition, ctx: &mut SharedContext) {
        match transition {
            PowerTransition::EnterPowerSave => {
                log::info!("entering power save mode");
                self.control.set_power_save(true);
                ctx.ui.set_backlight(false);
                self.set_state(PowerState::PowerSave);
            }
            PowerTransition::ExitPowerSave => {
                log::info!("activity detected, leaving power save mode");
                self.control.set_power_save(false);
                ctx.ui.set_backlight(true);
                self.set_state(PowerState::Normal);
            }
            PowerTransition::EnterDeepSleep => {
                log::info!("entering deep sleep; wake on GPIO {WAKE_PINS:?}");
                self.set_state(PowerState::DeepSleep);
                ctx.services.mqtt.disconnect();
                ctx.services.server_link.disconnect();
                ctx.ui.power_down();
                self.control.enter_deep_sleep(&WAKE_PINS);
            }
        }
    }
}

/// UI refresh plus the sleep monitor.
pub struct DisplayLoop {
    shared: Arc<Mutex<SharedContext>>,
    power: PowerManager,
    monitor: SleepMonitor,
    clock: Clock,
}

impl DisplayLoop {
    /// One iteration. Returns the delay before the next one, or `None`
    /// once the device is halting.
    pub fn run_once(&mut self) -> Option<Duration> {
        if self.power.state() == PowerState::DeepSleep {
            return None;
        }

        let now_ms = (self.clock)();
        let Some(mut ctx) = lock_within(&self.shared, LOCK_TIMEOUT) else {
            log::debug!("display loop skipped: lock busy");
            return Some(self.power.loop_delay(LoopKind::Display));
        };

        let status = ctx.services.status(self.power.state());
        ctx.ui.update(&status);

        let activity = ctx.ui.has_new_event() | ctx.services.inbox.take_activity();
        let transition = if self.power.take_sleep_request() {
            self.monitor.request_deep_sleep()
        } else {
            self.monitor.check_activity(activity, now_ms)
        };

        if let Some(transition) = transition {
            self.power.apply(transition, &mut ctx);
        }
        drop(ctx);

        match self.power.state() {
            PowerState::DeepSleep => None,
            _ => Some(self.power.loop_delay(LoopKind::Display)),
        }
    }

    pub fn monitor(&self) -> &SleepMonitor {
        &self.monitor
    }
}

/// Round-robin connectivity servicing plus the command interpreter.
pub struct NetworkLoop {
    shared: Arc<Mutex<SharedContext>>,
    power: PowerManager,
    dispatcher: RoundRobin,
    clock: Clock,
}

impl NetworkLoop {
    pub fn run_once(&mut self) -> Option<Duration> {
        if self.power.state() == PowerState::DeepSleep {
            return None;
        }

        let now_ms = (self.clock)();
        match lock_within(&self.shared, LOCK_TIMEOUT) {
            Some(mut guard) => {
                let ctx = &mut *guard;
                let subsystem = self.dispatcher.next_subsystem();
                ctx.services.service(subsystem, now_ms);
                ctx.interpreter.update(&mut ctx.services, now_ms);
            }
            None => log::debug!("network loop skipped: lock busy"),
        }

        Some(self.power.loop_delay(LoopKind::Network))
    }
}

pub struct Scheduler {
    shared: Arc<Mutex<SharedContext>>,
    power: PowerManager,
    clock: Clock,
}

pub struct SchedulerHandle {
    display: thread::JoinHandle<()>,
    network: thread::JoinHandle<()>,
    stop: Arc<AtomicBool>,
    power: PowerManager,
}

impl Scheduler {
    pub fn new(ctx: SharedContext, power: PowerManager, clock: Clock) -> Self {
        Self {
            shared: Arc::new(Mutex::new(ctx)),
            power,
            clock,
        }
    }

    pub fn shared(&self) -> Arc<Mutex<SharedContext>> {
        self.shared.clone()
    }

    pub fn power(&self) -> PowerManager {
        self.power.clone()
    }

    pub fn display_loop(&self, monitor: SleepMonitor) -> DisplayLoop {
        DisplayLoop {
            shared: self.shared.clone(),
            power: self.power.clone(),
            monitor,
            clock: self.clock.clone(),
        }
    }

    pub fn network_loop(&self) -> NetworkLoop {
        NetworkLoop {
            shared: self.shared.clone(),
            power: self.power.clone(),
            dispatcher: RoundRobin::default(),
            clock: self.clock.clone(),
        }
    }

    /// Enables the sleep monitor, then spawns both loops.
    pub fn start(self, mut monitor: SleepMonitor) -> io::Result<SchedulerHandle> {
        let stop = Arc::new(AtomicBool::new(false));

        monitor.enable((self.clock)());
        let mut display = self.display_loop(monitor);
        let display = spawn_loop(&self.power, LoopKind::Display, stop.clone(), move || {
            display.run_once()
        })?;

        let mut network = self.network_loop();
        let network = spawn_loop(&self.power, LoopKind::Network, stop.clone(), move || {
            network.run_once()
        })?;

        log::info!("display and network loops started");
        Ok(SchedulerHandle {
            display,
            network,
            stop,
            power: self.power,
        })
    }
}

fn spawn_loop(
    power: &PowerManager,
    kind: LoopKind,
    stop: Arc<AtomicBool>,
    mut iteration: impl FnMut() -> Option<Duration> + Send + 'static,
) -> io::Result<thread::JoinHandle<()>> {
    power.control.prepare_spawn(kind);
    let control = power.control.clone();
    thread::Builder::new()
        .name(format!("{}-loop", kind.as_str()))
        .stack_size(TASK_STACK_SIZE)
        .spawn(move || {
            control.register_loop(kind);
            while !stop.load(Ordering::Acquire) {
                match iteration() {
                    Some(delay) => thread::sleep(delay),
                    None => break,
                }
            }
            log::info!("{} loop stopped", kind.as_str());
        })
}

impl SchedulerHandle {
    pub fn power(&self) -> PowerManager {
        self.power.clone()
    }

    pub fn is_halted(&self) -> bool {
        self.display.is_finished() && self.network.is_finished()
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn join(self) {
        if self.display.join().is_err() {
            log::warn!("display loop panicked");
        }
        if self.network.join().is_err() {
            log::warn!("network loop panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU64;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{config::KnobConfig, services::tests::services_with, types::Channel};

    #[derive(Default)]
    struct UiProbe {
        touched: Arc<AtomicBool>,
        backlight: Arc<Mutex<Vec<bool>>>,
        powered_down: Arc<AtomicBool>,
    }

    struct FakeUi(UiProbe);

    impl UiSurface for FakeUi {
        fn update(&mut self, _status: &ConnectivityStatus) {}

        fn has_new_event(&mut self) -> bool {
            self.0.touched.swap(false, Ordering::SeqCst)
        }

        fn set_backlight(&mut self, on: bool) {
            self.0.backlight.lock().unwrap().push(on);
        }

        fn power_down(&mut self) {
            self.0.powered_down.store(true, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct Recorder {
        power_save: Mutex<Vec<bool>>,
        deep_sleep: Mutex<Option<Vec<i32>>>,
    }

    impl PowerControl for Recorder {
        fn set_power_save(&self, enabled: bool) {
            self.power_save.lock().unwrap().push(enabled);
        }

        fn enter_deep_sleep(&self, wake_pins: &[i32]) {
            *self.deep_sleep.lock().unwrap() = Some(wake_pins.to_vec());
        }
    }

    struct CountingInterpreter(Arc<AtomicU64>);

    impl CommandInterpreter for CountingInterpreter {
        fn update(&mut self, services: &mut ConnectivityServices, _now_ms: u64) {
            self.0.fetch_add(1, Ordering::SeqCst);
            let _ = services.inbox.take(Channel::Tcp);
        }
    }

    struct Harness {
        scheduler: Scheduler,
        recorder: Arc<Recorder>,
        ui: UiProbe,
        now: Arc<AtomicU64>,
        interpreted: Arc<AtomicU64>,
    }

    fn harness() -> Harness {
        let ui = UiProbe::default();
        let fake_ui = FakeUi(UiProbe {
            touched: ui.touched.clone(),
            backlight: ui.backlight.clone(),
            powered_down: ui.powered_down.clone(),
        });
        let interpreted = Arc::new(AtomicU64::new(0));
        let ctx = SharedContext {
            services: services_with(KnobConfig::default(), &[], false),
            ui: Box::new(fake_ui),
            interpreter: Box::new(CountingInterpreter(interpreted.clone())),
        };
        let recorder = Arc::new(Recorder::default());
        let now = Arc::new(AtomicU64::new(0));
        let clock_now = now.clone();
        let clock: Clock = Arc::new(move || clock_now.load(Ordering::SeqCst));
        Harness {
            scheduler: Scheduler::new(ctx, PowerManager::new(recorder.clone()), clock),
            recorder,
            ui,
            now,
            interpreted,
        }
    }

    fn enabled_monitor() -> SleepMonitor {
        let mut monitor = SleepMonitor::new(KnobConfig::default().power, 0);
        monitor.enable(0);
        monitor
    }

    #[test]
    fn round_robin_cycles_fixed_order() {
        let mut dispatcher = RoundRobin::default();
        let order: Vec<Subsystem> = (0..4).map(|_| dispatcher.next_subsystem()).collect();

        assert_eq!(
            order,
            vec![
                Subsystem::Wifi,
                Subsystem::Tcp,
                Subsystem::Mqtt,
                Subsystem::Wifi
            ]
        );
    }

    #[test]
    fn lock_within_gives_up_when_held() {
        let mutex = Arc::new(Mutex::new(0));
        let held = mutex.clone();
        let (locked_tx, locked_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let holder = thread::spawn(move || {
            let _guard = held.lock().unwrap();
            locked_tx.send(()).unwrap();
            let _ = release_rx.recv();
        });
        locked_rx.recv().unwrap();

        let start = Instant::now();
        assert!(lock_within(&mutex, Duration::from_millis(10)).is_none());
        assert!(start.elapsed() < Duration::from_secs(1));

        release_tx.send(()).unwrap();
        holder.join().unwrap();
        assert!(lock_within(&mutex, Duration::from_millis(10)).is_some());
    }

    #[test]
    fn network_loop_skips_when_lock_is_busy() {
        let h = harness();
        let mut network = h.scheduler.network_loop();
        let shared = h.scheduler.shared();

        let guard = shared.lock().unwrap();
        assert_eq!(network.run_once(), Some(NETWORK_DELAY_NORMAL));
        assert_eq!(h.interpreted.load(Ordering::SeqCst), 0);
        drop(guard);

        network.run_once();
        assert_eq!(h.interpreted.load(Ordering::SeqCst), 1);
        assert_eq!(network.dispatcher.next_subsystem(), Subsystem::Tcp);
    }

    #[test]
    fn inactivity_enters_power_save_and_activity_restores_normal() {
        let h = harness();
        let mut display = h.scheduler.display_loop(enabled_monitor());

        h.now.store(30_000, Ordering::SeqCst);
        assert_eq!(display.run_once(), Some(DISPLAY_DELAY_POWER_SAVE));
        assert_eq!(h.scheduler.power().state(), PowerState::PowerSave);
        assert_eq!(
            h.scheduler.power().loop_delay(LoopKind::Network),
            NETWORK_DELAY_POWER_SAVE
        );

        h.ui.touched.store(true, Ordering::SeqCst);
        h.now.store(40_000, Ordering::SeqCst);
        assert_eq!(display.run_once(), Some(DISPLAY_DELAY_NORMAL));
        assert_eq!(h.scheduler.power().state(), PowerState::Normal);
        assert_eq!(display.monitor().last_activity_ms(), 40_000);
        assert_eq!(*h.recorder.power_save.lock().unwrap(), vec![true, false]);
        assert_eq!(*h.ui.backlight.lock().unwrap(), vec![false, true]);
    }

    #[test]
    fn inbound_command_counts_as_activity() {
        let h = harness();
        let mut display = h.scheduler.display_loop(enabled_monitor());
        h.now.store(29_000, Ordering::SeqCst);
        h.scheduler
            .shared()
            .lock()
            .unwrap()
            .services
            .inbox
            .deliver(Channel::Tcp, "status");
        display.run_once();

        h.now.store(58_999, Ordering::SeqCst);
        display.run_once();
        assert_eq!(h.scheduler.power().state(), PowerState::Normal);
    }

    #[test]
    fn deep_sleep_is_terminal() {
        let h = harness();
        let mut display = h.scheduler.display_loop(enabled_monitor());
        let mut network = h.scheduler.network_loop();

        h.now.store(3_600_000, Ordering::SeqCst);
        assert_eq!(display.run_once(), None);

        assert_eq!(h.scheduler.power().state(), PowerState::DeepSleep);
        assert_eq!(
            *h.recorder.deep_sleep.lock().unwrap(),
            Some(WAKE_PINS.to_vec())
        );
        assert!(h.ui.powered_down.load(Ordering::SeqCst));
        assert_eq!(network.run_once(), None);
        assert_eq!(display.run_once(), None);
    }

    #[test]
    fn explicit_sleep_request_needs_enabled_monitor() {
        let h = harness();
        let disabled = SleepMonitor::new(KnobConfig::default().power, 0);
        let mut display = h.scheduler.display_loop(disabled);

        h.scheduler.power().request_deep_sleep();
        display.run_once();
        assert_eq!(h.scheduler.power().state(), PowerState::Normal);

        let mut display = h.scheduler.display_loop(enabled_monitor());
        h.scheduler.power().request_deep_sleep();
        assert_eq!(display.run_once(), None);
        assert_eq!(h.scheduler.power().state(), PowerState::DeepSleep);
    }

    #[test]
    fn started_loops_halt_on_sleep_request() {
        let h = harness();
        let power = h.scheduler.power();
        let handle = h.scheduler.start(SleepMonitor::new(KnobConfig::default().power, 0)).unwrap();

        power.request_deep_sleep();
        let deadline = Instant::now() + Duration::from_secs(2);
        while !handle.is_halted() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }

        assert!(handle.is_halted());
        assert_eq!(power.state(), PowerState::DeepSleep);
        handle.join();
    }
}
