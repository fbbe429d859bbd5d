//! `rill.time`: clocks and sleeping, on the wall clock or a virtual one.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use rill_runtime::scheduler::{ClockHandle, DeterministicRuntime};
use rill_runtime::Value;

use super::{arg_i64, Capability, CapabilityHandlers};
use crate::config::TimeConfig;
use crate::error::HostError;
use crate::registry::HostHandler;

const OPS: &[&str] = &["now", "monotonic", "sleep"];

#[derive(Debug, Clone)]
enum Clock {
    Wall { started: Instant },
    Virtual {
        runtime: Arc<Mutex<DeterministicRuntime>>,
        clock: ClockHandle,
    },
}

#[derive(Debug, Clone)]
pub struct Time {
    clock: Clock,
}

impl Time {
    pub fn new(config: &TimeConfig) -> Self {
        if config.virtual_clock {
            Self::virtual_clock(Arc::new(Mutex::new(DeterministicRuntime::new(config.runtime.clone()))))
        } else {
            Self {
                clock: Clock::Wall {
                    started: Instant::now(),
                },
            }
        }
    }

    /// Serve time from `runtime`; `sleep` advances it.
    ///
    /// Clock reads never take the runtime lock, so timer callbacks fired by
    /// `sleep` may read the time. A `sleep` from inside such a callback
    /// fails instead of blocking.
    pub fn virtual_clock(runtime: Arc<Mutex<DeterministicRuntime>>) -> Self {
        let clock = runtime.lock().clock();
        Self {
            clock: Clock::Virtual { runtime, clock },
        }
    }
}

fn wall_now() -> Result<i64, HostError> {
    let elapsed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| HostError::handler(format!("system clock is before the epoch: {}", e)))?;
    Ok(elapsed.as_millis() as i64)
}

impl Capability for Time {
    fn name(&self) -> &'static str {
        "time"
    }

    fn effect_id(&self) -> &'static str {
        "rill.time"
    }

    fn op_names(&self) -> &'static [&'static str] {
        OPS
    }

    fn handlers(&self) -> CapabilityHandlers {
        let handlers = match &self.clock {
            Clock::Wall { started } => {
                let started = *started;
                vec![
                    ("now", HostHandler::from_fn(|_| wall_now().map(Value::I64))),
                    (
                        "monotonic",
                        HostHandler::from_fn(move |_| Ok(Value::I64(started.elapsed().as_millis() as i64))),
                    ),
                    (
                        "sleep",
                        HostHandler::from_async(|args: Vec<Value>| async move {
                            let ms = arg_i64("sleep", &args, 0)?.max(0) as u64;
                            tokio::time::sleep(Duration::from_millis(ms)).await;
                            Ok(Value::Unit)
                        }),
                    ),
                ]
            }
            Clock::Virtual { runtime, clock } => {
                let (now, mono, sleep) = (clock.clone(), clock.clone(), Arc::clone(runtime));
                vec![
                    ("now", HostHandler::from_fn(move |_| Ok(Value::I64(now.now_system())))),
                    (
                        "monotonic",
                        HostHandler::from_fn(move |_| Ok(Value::I64(mono.now_monotonic() as i64))),
                    ),
                    (
                        "sleep",
                        HostHandler::from_fn(move |args| {
                            let ms = arg_i64("sleep", args, 0)?.max(0) as u64;
                            let mut runtime = sleep
                                .try_lock()
                                .ok_or_else(|| HostError::handler("virtual clock is busy firing timers"))?;
                            runtime.advance_by(ms).map_err(|e| HostError::handler(e.to_string()))?;
                            Ok(Value::Unit)
                        }),
                    ),
                ]
            }
        };
        Ok(handlers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::register_capability;
    use crate::capabilities::tests::registry_for;
    use rill_runtime::RuntimeConfig;

    #[test]
    fn test_virtual_sleep_advances_clock_and_fires_timers() {
        let runtime = Arc::new(Mutex::new(DeterministicRuntime::new(RuntimeConfig {
            initial_system_ms: 1_000,
            ..RuntimeConfig::default()
        })));
        let fired = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&fired);
        runtime.lock().set_timeout(50, move |_| *flag.lock() = true);

        let registry = registry_for(&[("rill.time", OPS)]);
        register_capability(&registry, &Time::virtual_clock(Arc::clone(&runtime)));

        registry.invoke_blocking(2, vec![Value::I64(75)]).unwrap();
        assert!(*fired.lock());
        assert_eq!(registry.invoke_blocking(1, vec![]).unwrap(), Value::I64(75));
        assert_eq!(registry.invoke_blocking(0, vec![]).unwrap(), Value::I64(1_075));
    }

    #[test]
    fn test_timer_callback_can_read_the_clock_during_sleep() {
        let runtime = Arc::new(Mutex::new(DeterministicRuntime::new(RuntimeConfig {
            initial_system_ms: 1_000,
            ..RuntimeConfig::default()
        })));
        let registry = Arc::new(registry_for(&[("rill.time", OPS)]));
        register_capability(&registry, &Time::virtual_clock(Arc::clone(&runtime)));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let (sink, reader) = (Arc::clone(&seen), Arc::clone(&registry));
        runtime.lock().set_timeout(30, move |_| {
            // Another thread, as a host embedding would call in.
            let reader = Arc::clone(&reader);
            let handle = std::thread::spawn(move || {
                let now = reader.invoke_blocking(0, vec![]).unwrap();
                let sleep = reader.invoke_blocking(2, vec![Value::I64(1)]);
                (now, sleep)
            });
            sink.lock().push(handle.join().unwrap());
        });

        registry.invoke_blocking(2, vec![Value::I64(50)]).unwrap();
        let seen = seen.lock();
        let [(now, nested)] = &seen[..] else {
            panic!("timer fired {} times", seen.len());
        };
        assert_eq!(now, &Value::I64(1_030));
        assert!(matches!(nested, Err(HostError::Handler(_))));
        assert_eq!(registry.invoke_blocking(1, vec![]).unwrap(), Value::I64(50));
    }

    #[test]
    fn test_wall_clock_is_after_epoch() {
        let registry = registry_for(&[("rill.time", OPS)]);
        register_capability(&registry, &Time::new(&TimeConfig::default()));
        match registry.invoke_blocking(0, vec![]).unwrap() {
            Value::I64(ms) => assert!(ms > 0),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(registry.invoke_blocking(2, vec![Value::I64(1)]).unwrap(), Value::Unit);
    }
}
