//! `rill.random`: a seeded or OS-seeded generator.

use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::{OsRng, StdRng};
use rand::{Rng, RngCore, SeedableRng};

use rill_runtime::Value;

use super::{arg_i64, Capability, CapabilityHandlers};
use crate::config::RandomConfig;
use crate::error::HostError;
use crate::registry::HostHandler;

const OPS: &[&str] = &["next_i32", "next_i64", "next_f64", "bytes", "range"];

/// Largest `bytes` request served at once.
const MAX_BYTES: i64 = 1 << 20;

#[derive(Debug, Clone)]
pub struct Random {
    seed: Option<u64>,
}

impl Random {
    pub fn new(config: &RandomConfig) -> Self {
        Self { seed: config.seed }
    }

    /// A fixed seed, or one drawn from the OS; fails when the OS has no
    /// usable source.
    fn generator(&self) -> Result<StdRng, String> {
        match self.seed {
            Some(seed) => Ok(StdRng::seed_from_u64(seed)),
            None => StdRng::from_rng(OsRng).map_err(|e| format!("no secure random source: {}", e)),
        }
    }
}

impl Capability for Random {
    fn name(&self) -> &'static str {
        "random"
    }

    fn effect_id(&self) -> &'static str {
        "rill.random"
    }

    fn op_names(&self) -> &'static [&'static str] {
        OPS
    }

    fn handlers(&self) -> CapabilityHandlers {
        let rng = Arc::new(Mutex::new(self.generator()?));
        let with = |f: fn(&mut StdRng, &[Value]) -> Result<Value, HostError>| {
            let rng = Arc::clone(&rng);
            HostHandler::from_fn(move |args| f(&mut rng.lock(), args))
        };
        Ok(vec![
            ("next_i32", with(|rng, _| Ok(Value::I32(rng.gen())))),
            ("next_i64", with(|rng, _| Ok(Value::I64(rng.gen())))),
            ("next_f64", with(|rng, _| Ok(Value::F64(rng.gen())))),
            (
                "bytes",
                with(|rng, args| {
                    let len = arg_i64("bytes", args, 0)?.clamp(0, MAX_BYTES) as usize;
                    let mut buf = vec![0u8; len];
                    rng.fill_bytes(&mut buf);
                    Ok(Value::Bytes(buf))
                }),
            ),
            (
                "range",
                with(|rng, args| {
                    let (lo, hi) = (arg_i64("range", args, 0)?, arg_i64("range", args, 1)?);
                    if lo >= hi {
                        return Err(HostError::handler(format!("empty range {}..{}", lo, hi)));
                    }
                    Ok(Value::I64(rng.gen_range(lo..hi)))
                }),
            ),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::register_capability;
    use crate::capabilities::tests::registry_for;

    fn seeded(seed: u64) -> Vec<Value> {
        let registry = registry_for(&[("rill.random", OPS)]);
        register_capability(&registry, &Random::new(&RandomConfig { seed: Some(seed) }));
        (0..4).map(|_| registry.invoke_blocking(1, vec![]).unwrap()).collect()
    }

    #[test]
    fn test_seed_is_reproducible() {
        assert_eq!(seeded(7), seeded(7));
        assert_ne!(seeded(7), seeded(8));
    }

    #[test]
    fn test_range_and_bytes() {
        let registry = registry_for(&[("rill.random", OPS)]);
        register_capability(&registry, &Random::new(&RandomConfig { seed: Some(1) }));
        for _ in 0..32 {
            match registry.invoke_blocking(4, vec![Value::I64(-3), Value::I64(3)]).unwrap() {
                Value::I64(v) => assert!((-3..3).contains(&v)),
                other => panic!("unexpected {:?}", other),
            }
        }
        assert!(registry.invoke_blocking(4, vec![Value::I64(3), Value::I64(3)]).is_err());
        assert_eq!(
            registry.invoke_blocking(3, vec![Value::I32(5)]).unwrap().as_bytes().map(<[u8]>::len),
            Some(5)
        );
    }
}
