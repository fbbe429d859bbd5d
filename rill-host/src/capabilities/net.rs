//! `rill.net`: TCP streams addressed by integer handles.

use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use rill_runtime::Value;

use super::{arg_bytes, arg_i64, arg_str, Capability, CapabilityHandlers};
use crate::config::NetConfig;
use crate::error::{HostError, Result};
use crate::registry::HostHandler;

const OPS: &[&str] = &["connect", "send", "recv", "close"];

/// Largest single `recv`.
const MAX_RECV: i64 = 64 * 1024;

type Stream = Arc<tokio::sync::Mutex<TcpStream>>;

#[derive(Debug, Default)]
struct Connections {
    next: i32,
    open: FxHashMap<i32, Stream>,
}

impl Connections {
    fn insert(&mut self, stream: TcpStream) -> i32 {
        self.next += 1;
        self.open.insert(self.next, Arc::new(tokio::sync::Mutex::new(stream)));
        self.next
    }

    fn get(&self, op: &str, handle: i64) -> Result<Stream> {
        i32::try_from(handle)
            .ok()
            .and_then(|h| self.open.get(&h).cloned())
            .ok_or_else(|| HostError::handler(format!("{}: no open connection {}", op, handle)))
    }
}

#[derive(Debug, Clone)]
pub struct Net {
    enabled: bool,
    connections: Arc<Mutex<Connections>>,
}

impl Net {
    pub fn new(config: &NetConfig) -> Self {
        Self {
            enabled: config.enabled,
            connections: Arc::default(),
        }
    }
}

impl Capability for Net {
    fn name(&self) -> &'static str {
        "net"
    }

    fn effect_id(&self) -> &'static str {
        "rill.net"
    }

    fn op_names(&self) -> &'static [&'static str] {
        OPS
    }

    fn handlers(&self) -> CapabilityHandlers {
        if !self.enabled {
            return Err("networking is disabled".to_string());
        }

        let conns = Arc::clone(&self.connections);
        let connect = HostHandler::from_async(move |args: Vec<Value>| {
            let conns = Arc::clone(&conns);
            async move {
                let addr = arg_str("connect", &args, 0)?;
                let stream = TcpStream::connect(addr).await?;
                Ok(Value::I32(conns.lock().insert(stream)))
            }
        });

        let conns = Arc::clone(&self.connections);
        let send = HostHandler::from_async(move |args: Vec<Value>| {
            let conns = Arc::clone(&conns);
            async move {
                let stream = conns.lock().get("send", arg_i64("send", &args, 0)?)?;
                let data = arg_bytes("send", &args, 1)?;
                stream.lock().await.write_all(data).await?;
                Ok(Value::I32(data.len() as i32))
            }
        });

        let conns = Arc::clone(&self.connections);
        let recv = HostHandler::from_async(move |args: Vec<Value>| {
            let conns = Arc::clone(&conns);
            async move {
                let stream = conns.lock().get("recv", arg_i64("recv", &args, 0)?)?;
                let max = arg_i64("recv", &args, 1)?.clamp(0, MAX_RECV) as usize;
                let mut buf = vec![0u8; max];
                let read = stream.lock().await.read(&mut buf).await?;
                buf.truncate(read);
                Ok(Value::Bytes(buf))
            }
        });

        let conns = Arc::clone(&self.connections);
        let close = HostHandler::from_fn(move |args| {
            let handle = arg_i64("close", args, 0)?;
            let closed = i32::try_from(handle)
                .ok()
                .and_then(|h| conns.lock().open.remove(&h));
            // Dropping the last reference shuts the stream.
            Ok(Value::Bool(closed.is_some()))
        });

        Ok(vec![("connect", connect), ("send", send), ("recv", recv), ("close", close)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::register_capability;
    use crate::capabilities::tests::registry_for;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_echo_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 16];
            let n = socket.read(&mut buf).await.unwrap();
            socket.write_all(&buf[..n]).await.unwrap();
        });

        let registry = registry_for(&[("rill.net", OPS)]);
        let report = register_capability(&registry, &Net::new(&NetConfig { enabled: true }));
        assert!(report.supported);

        let handle = registry
            .invoke(0, vec![Value::Str(addr.to_string())])
            .await
            .unwrap();
        assert_eq!(handle, Value::I32(1));
        let sent = registry
            .invoke(1, vec![handle.clone(), Value::Bytes(b"ping".to_vec())])
            .await
            .unwrap();
        assert_eq!(sent, Value::I32(4));
        let got = registry.invoke(2, vec![handle.clone(), Value::I32(16)]).await.unwrap();
        assert_eq!(got, Value::Bytes(b"ping".to_vec()));

        assert_eq!(registry.invoke(3, vec![handle.clone()]).await.unwrap(), Value::Bool(true));
        assert_eq!(registry.invoke(3, vec![handle.clone()]).await.unwrap(), Value::Bool(false));
        assert!(registry.invoke(1, vec![handle, Value::Bytes(vec![1])]).await.is_err());
    }
}
