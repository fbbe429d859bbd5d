//! `rill.console`: guest text on stdout, lines from stdin.

use std::io::Write;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, BufReader};

use rill_runtime::Value;

use super::{arg_str, Capability, CapabilityHandlers};
use crate::config::ConsoleConfig;
use crate::registry::HostHandler;

const OPS: &[&str] = &["print", "println", "read_line"];

type Writer = Arc<Mutex<Box<dyn Write + Send>>>;

#[derive(Clone)]
pub struct Console {
    enabled: bool,
    out: Writer,
}

impl std::fmt::Debug for Console {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Console").field("enabled", &self.enabled).finish()
    }
}

impl Console {
    pub fn new(config: &ConsoleConfig) -> Self {
        Self::with_writer(config, Box::new(std::io::stdout()))
    }

    /// Send guest output to `out` instead of stdout.
    pub fn with_writer(config: &ConsoleConfig, out: Box<dyn Write + Send>) -> Self {
        Self {
            enabled: config.enabled,
            out: Arc::new(Mutex::new(out)),
        }
    }

    fn printer(&self, op: &'static str, newline: bool) -> HostHandler {
        let out = Arc::clone(&self.out);
        HostHandler::from_fn(move |args| {
            let text = arg_str(op, args, 0)?;
            let mut out = out.lock();
            out.write_all(text.as_bytes())?;
            if newline {
                out.write_all(b"\n")?;
            }
            out.flush()?;
            Ok(Value::Unit)
        })
    }
}

impl Capability for Console {
    fn name(&self) -> &'static str {
        "console"
    }

    fn effect_id(&self) -> &'static str {
        "rill.console"
    }

    fn op_names(&self) -> &'static [&'static str] {
        OPS
    }

    fn handlers(&self) -> CapabilityHandlers {
        if !self.enabled {
            return Err("console is disabled".to_string());
        }
        let read_line = HostHandler::from_async(|_| async {
            let mut line = String::new();
            let read = BufReader::new(tokio::io::stdin()).read_line(&mut line).await?;
            if read == 0 {
                // End of input.
                return Ok(Value::Unit);
            }
            let trimmed = line.trim_end_matches(['\n', '\r']).len();
            line.truncate(trimmed);
            Ok(Value::Str(line))
        });
        Ok(vec![
            ("print", self.printer("print", false)),
            ("println", self.printer("println", true)),
            ("read_line", read_line),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::register_capability;
    use crate::capabilities::tests::registry_for;
    use crate::error::HostError;

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_print_and_println() {
        let captured = Captured::default();
        let console = Console::with_writer(&ConsoleConfig::default(), Box::new(captured.clone()));
        let registry = registry_for(&[("rill.console", OPS)]);
        register_capability(&registry, &console);

        registry.invoke_blocking(0, vec![Value::Str("a".into())]).unwrap();
        registry.invoke_blocking(1, vec![Value::Str("b".into())]).unwrap();
        assert_eq!(captured.0.lock().as_slice(), b"ab\n");
    }

    #[test]
    fn test_disabled_console() {
        let registry = registry_for(&[("rill.console", OPS)]);
        let report = register_capability(&registry, &Console::new(&ConsoleConfig { enabled: false }));
        assert!(!report.supported);
        assert!(matches!(
            registry.invoke_blocking(0, vec![Value::Str("a".into())]),
            Err(HostError::Unsupported { .. })
        ));
    }
}
