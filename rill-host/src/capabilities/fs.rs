//! `rill.fs`: files under a sandbox root.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use rill_runtime::Value;

use super::{arg_bytes, arg_str, unsupported, Capability, CapabilityHandlers};
use crate::config::FsConfig;
use crate::error::{HostError, Result};
use crate::registry::HostHandler;

const OPS: &[&str] = &["read", "read_text", "write", "exists", "remove"];

#[derive(Debug, Clone)]
pub struct Fs {
    enabled: bool,
    root: Arc<PathBuf>,
    read_only: bool,
}

impl Fs {
    pub fn new(config: &FsConfig) -> Self {
        Self {
            enabled: config.enabled,
            root: Arc::new(config.root.clone()),
            read_only: config.read_only,
        }
    }

    fn handler<F, Fut>(&self, op: &'static str, f: F) -> HostHandler
    where
        F: Fn(PathBuf, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value>> + Send + 'static,
    {
        let root = Arc::clone(&self.root);
        HostHandler::from_async(move |args: Vec<Value>| {
            let path = arg_str(op, &args, 0).and_then(|p| resolve(&root, p));
            let fut = path.map(|path| f(path, args));
            async move { fut?.await }
        })
    }
}

/// Join a guest path onto `root`, refusing anything that could leave it.
fn resolve(root: &Path, guest: &str) -> Result<PathBuf> {
    let relative = Path::new(guest);
    let escapes = relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes {
        return Err(HostError::handler(format!("path `{}` leaves the sandbox", guest)));
    }
    Ok(root.join(relative))
}

impl Capability for Fs {
    fn name(&self) -> &'static str {
        "fs"
    }

    fn effect_id(&self) -> &'static str {
        "rill.fs"
    }

    fn op_names(&self) -> &'static [&'static str] {
        OPS
    }

    fn handlers(&self) -> CapabilityHandlers {
        if !self.enabled {
            return Err("filesystem access is disabled".to_string());
        }
        let mut handlers = vec![
            (
                "read",
                self.handler("read", |path, _| async move { Ok(Value::Bytes(tokio::fs::read(path).await?)) }),
            ),
            (
                "read_text",
                self.handler("read_text", |path, _| async move {
                    Ok(Value::Str(tokio::fs::read_to_string(path).await?))
                }),
            ),
            (
                "exists",
                self.handler("exists", |path, _| async move {
                    Ok(Value::Bool(tokio::fs::try_exists(path).await?))
                }),
            ),
        ];
        if self.read_only {
            for op in ["write", "remove"] {
                handlers.push((op, unsupported(self.name(), op, "filesystem is read-only")));
            }
        } else {
            handlers.push((
                "write",
                self.handler("write", |path, args| async move {
                    let contents = arg_bytes("write", &args, 1)?.to_vec();
                    tokio::fs::write(path, contents).await?;
                    Ok(Value::Unit)
                }),
            ));
            handlers.push((
                "remove",
                self.handler("remove", |path, _| async move {
                    tokio::fs::remove_file(path).await?;
                    Ok(Value::Unit)
                }),
            ));
        }
        Ok(handlers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::register_capability;
    use crate::capabilities::tests::registry_for;

    #[test]
    fn test_resolve_stays_under_root() {
        let root = Path::new("/sandbox");
        assert_eq!(resolve(root, "a/b.txt").unwrap(), PathBuf::from("/sandbox/a/b.txt"));
        assert!(resolve(root, "../etc/passwd").is_err());
        assert!(resolve(root, "/etc/passwd").is_err());
        assert!(resolve(root, "a/../../b").is_err());
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_for(&[("rill.fs", OPS)]);
        let fs = Fs::new(&FsConfig {
            enabled: true,
            root: dir.path().to_path_buf(),
            read_only: false,
        });
        let report = register_capability(&registry, &fs);
        assert_eq!(report.registered, OPS.len());

        registry
            .invoke(2, vec![Value::Str("note.txt".into()), Value::Str("hello".into())])
            .await
            .unwrap();
        let text = registry.invoke(1, vec![Value::Str("note.txt".into())]).await.unwrap();
        assert_eq!(text, Value::Str("hello".into()));
        let exists = registry.invoke(3, vec![Value::Str("note.txt".into())]).await.unwrap();
        assert_eq!(exists, Value::Bool(true));
    }

    #[tokio::test]
    async fn test_read_only_refuses_writes() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_for(&[("rill.fs", OPS)]);
        let fs = Fs::new(&FsConfig {
            enabled: true,
            root: dir.path().to_path_buf(),
            read_only: true,
        });
        let report = register_capability(&registry, &fs);
        assert!(report.supported);

        let err = registry
            .invoke(2, vec![Value::Str("x".into()), Value::Bytes(vec![1])])
            .await
            .unwrap_err();
        assert!(matches!(err, HostError::Unsupported { .. }));
    }
}
