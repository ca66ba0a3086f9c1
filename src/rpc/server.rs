// src/rpc/server.rs
//! RPC server: accept loop and per-connection dispatch.

use std::sync::Arc;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use metrics::counter;
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::rpc::codec;
use crate::rpc::message::{Request, Response};
use crate::utils::errors::Result;

/// Routes an incoming request to an agent or manager inside an environment
#[async_trait]
pub trait Dispatcher: Send + Sync + 'static {
    async fn dispatch(&self, target: u32, method: &str, params: Value) -> Result<Value>;
}

/// Serve RPC requests until `stop` flips to `true`
///
/// Each accepted connection is handled on its own task, so a slow agent does
/// not block requests to its neighbors.
pub async fn serve(
    listener: TcpListener,
    dispatcher: Arc<dyn Dispatcher>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "rpc connection accepted");
                        let dispatcher = Arc::clone(&dispatcher);
                        tokio::spawn(handle_connection(stream, dispatcher));
                    }
                    Err(e) => {
                        warn!("failed to accept rpc connection: {}", e);
                    }
                }
            }
        }
    }
    debug!("rpc server stopped");
}

async fn handle_connection(stream: TcpStream, dispatcher: Arc<dyn Dispatcher>) {
    let mut framed = codec::frame(stream);

    while let Some(frame) = framed.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                debug!("rpc connection read error: {}", e);
                break;
            }
        };

        let response = match codec::decode::<Request>(&frame) {
            Ok(request) => {
                counter!("agora_rpc_requests_total").increment(1);
                let Request {
                    id,
                    target,
                    method,
                    params,
                } = request;
                match dispatcher.dispatch(target, &method, params).await {
                    Ok(result) => Response::ok(id, result),
                    Err(e) => {
                        counter!("agora_rpc_errors_total").increment(1);
                        Response::error(id, e.to_string())
                    }
                }
            }
            Err(e) => Response::error(0, format!("malformed request: {}", e)),
        };

        let payload = match codec::encode(&response) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("failed to encode rpc response: {}", e);
                break;
            }
        };
        if let Err(e) = framed.send(payload).await {
            debug!("rpc connection write error: {}", e);
            break;
        }
    }
}
