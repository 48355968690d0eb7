// ── WebSocket server ──
//
// One task per connection. Each client gets a Fanout registration and a
// control worker: text frames are queued to the worker, which runs them
// through `Fanout::handle_text` one at a time. Replies and queued events are
// written back as JSON text frames, so a slow control call (a BLE handshake)
// never holds up event delivery or shutdown.

use std::net::SocketAddr;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use pedalwire_core::{ClientId, CoreError, Fanout, ServerMessage};

/// Control requests a client may have queued behind one in flight.
const PENDING_REQUESTS: usize = 16;

/// Accept connections until `cancel` fires, then close every open one.
pub async fn run(listener: TcpListener, fanout: Fanout, cancel: CancellationToken) {
    let mut connections: Vec<JoinHandle<()>> = Vec::new();

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    connections.retain(|h| !h.is_finished());
                    connections.push(tokio::spawn(serve_connection(
                        stream,
                        peer,
                        fanout.clone(),
                        cancel.child_token(),
                    )));
                }
                Err(e) => warn!(error = %e, "accept failed"),
            }
        }
    }

    for handle in connections {
        let _ = handle.await;
    }
    info!("WebSocket listener stopped");
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    fanout: Fanout,
    cancel: CancellationToken,
) {
    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!(%peer, error = %e, "WebSocket handshake failed");
            return;
        }
    };
    let (mut sink, mut source) = ws.split();
    let (client, mut outbound) = fanout.register_client();
    let (request_tx, request_rx) = mpsc::channel(PENDING_REQUESTS);
    let (reply_tx, mut replies) = mpsc::channel(PENDING_REQUESTS);
    let worker = tokio::spawn(control_worker(fanout.clone(), client, request_rx, reply_tx));
    info!(%peer, client_id = %client, "client connected");

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
            queued = outbound.recv() => {
                let Some(msg) = queued else { break };
                if send(&mut sink, &msg).await.is_err() {
                    break;
                }
            }
            reply = replies.recv() => {
                let Some(reply) = reply else { break };
                if send(&mut sink, &reply).await.is_err() {
                    break;
                }
            }
            incoming = source.next() => {
                let text = match incoming {
                    Some(Ok(Message::Text(text))) => text.as_str().to_owned(),
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
                        Ok(text) => text,
                        Err(_) => {
                            let reply = rejection("binary frame is not UTF-8 JSON");
                            if send(&mut sink, &reply).await.is_err() {
                                break;
                            }
                            continue;
                        }
                    },
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        debug!(client_id = %client, error = %e, "read failed");
                        break;
                    }
                };
                if request_tx.try_send(text).is_err() {
                    warn!(client_id = %client, "control queue full, rejecting request");
                    let reply = rejection("too many requests in flight");
                    if send(&mut sink, &reply).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    // A departed client's last request still runs to completion so no
    // device is left mid-handshake; shutdown abandons it.
    drop(request_tx);
    if cancel.is_cancelled() {
        worker.abort();
    }
    fanout.remove_client(client);
    info!(%peer, client_id = %client, "client disconnected");
}

/// Run one client's control requests in arrival order.
async fn control_worker(
    fanout: Fanout,
    client: ClientId,
    mut requests: mpsc::Receiver<String>,
    replies: mpsc::Sender<ServerMessage>,
) {
    while let Some(text) = requests.recv().await {
        let reply = fanout.handle_text(client, &text).await;
        if replies.send(reply).await.is_err() {
            break;
        }
    }
}

fn rejection(message: &str) -> ServerMessage {
    ServerMessage::failure(
        None,
        &CoreError::InvalidRequest {
            message: message.into(),
        },
    )
}

async fn send<S>(sink: &mut S, msg: &ServerMessage) -> Result<(), ()>
where
    S: SinkExt<Message> + Unpin,
{
    let text = match serde_json::to_string(msg) {
        Ok(text) => text,
        Err(e) => {
            warn!(error = %e, "could not serialize outbound message");
            return Ok(());
        }
    };
    sink.send(Message::text(text)).await.map_err(|_| ())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use pedalwire_core::{Aggregator, AggregatorConfig, MemoryStore};
    use pedalwire_radio::RadioAdapter;
    use pedalwire_radio::ble::gatt;
    use pedalwire_radio::loopback::{LoopbackCentral, LoopbackPeripheral, StaticProbe};
    use pedalwire_radio::{BleAdapter, BleConfig};
    use serde_json::Value;
    use tokio_tungstenite::connect_async;

    use super::*;

    async fn start_server() -> (SocketAddr, Fanout, CancellationToken, JoinHandle<()>) {
        start_server_with(
            LoopbackPeripheral::new("AA:BB:CC:00:00:09", Some("HRM-Dual"))
                .with_service(gatt::HEART_RATE_SERVICE, gatt::HEART_RATE_MEASUREMENT),
        )
        .await
    }

    async fn start_server_with(
        peripheral: LoopbackPeripheral,
    ) -> (SocketAddr, Fanout, CancellationToken, JoinHandle<()>) {
        let central = LoopbackCentral::shared();
        central.add_peripheral(peripheral).await;
        let adapters: Vec<Arc<dyn RadioAdapter>> = vec![Arc::new(BleAdapter::new(
            central,
            Arc::new(StaticProbe::ready()),
            BleConfig::default(),
        ))];
        let agg = Aggregator::new(AggregatorConfig::default(), adapters, Arc::new(MemoryStore::new()));
        agg.start().await;
        let fanout = Fanout::new(agg, 64);
        fanout.start().await;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run(listener, fanout.clone(), cancel.clone()));
        (addr, fanout, cancel, handle)
    }

    async fn next_json<S>(source: &mut S) -> Value
    where
        S: StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        let msg = tokio::time::timeout(Duration::from_secs(5), source.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        serde_json::from_str(msg.to_text().unwrap()).unwrap()
    }

    /// Skip frames until one satisfies `pred`.
    async fn wait_json<S>(source: &mut S, pred: impl Fn(&Value) -> bool) -> Value
    where
        S: StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        loop {
            let msg = next_json(source).await;
            if pred(&msg) {
                return msg;
            }
        }
    }

    #[tokio::test]
    async fn control_round_trip_over_websocket() {
        let (addr, fanout, cancel, handle) = start_server().await;
        let (ws, _) = connect_async(format!("ws://{addr}")).await.unwrap();
        let (mut sink, mut source) = ws.split();

        sink.send(Message::text(
            r#"{"type":"subscribe","topic":"device-events","request_id":1}"#,
        ))
        .await
        .unwrap();
        let reply = next_json(&mut source).await;
        assert_eq!(reply["type"], "response");
        assert_eq!(reply["request_id"], 1);
        assert_eq!(reply["success"], true);

        sink.send(Message::text(r#"{"type":"start-scanning","request_id":2}"#))
            .await
            .unwrap();

        // The scan response and the discovery event race; collect both.
        let mut saw_response = false;
        let mut saw_discovery = false;
        for _ in 0..4 {
            let msg = next_json(&mut source).await;
            match msg["type"].as_str() {
                Some("response") => {
                    assert_eq!(msg["request_id"], 2);
                    saw_response = true;
                }
                Some("event") => {
                    assert_eq!(msg["topic"], "device-events");
                    if msg["event"]["type"] == "device-discovered" {
                        assert_eq!(msg["event"]["device"]["name"], "HRM-Dual");
                        saw_discovery = true;
                    }
                }
                other => panic!("unexpected frame type {other:?}"),
            }
            if saw_response && saw_discovery {
                break;
            }
        }
        assert!(saw_response && saw_discovery);

        cancel.cancel();
        handle.await.unwrap();
        fanout.aggregator().shutdown().await;
    }

    #[tokio::test]
    async fn garbage_frames_get_an_error_not_a_hangup() {
        let (addr, fanout, cancel, handle) = start_server().await;
        let (ws, _) = connect_async(format!("ws://{addr}")).await.unwrap();
        let (mut sink, mut source) = ws.split();

        sink.send(Message::text("{nope")).await.unwrap();
        let reply = next_json(&mut source).await;
        assert_eq!(reply["success"], false);
        assert_eq!(reply["error"]["code"], "invalid_request");

        sink.send(Message::text(r#"{"type":"get-status","request_id":"again"}"#))
            .await
            .unwrap();
        let reply = next_json(&mut source).await;
        assert_eq!(reply["request_id"], "again");
        assert_eq!(reply["success"], true);
        assert_eq!(fanout.client_count(), 1);

        cancel.cancel();
        handle.await.unwrap();
        fanout.aggregator().shutdown().await;
    }

    #[tokio::test]
    async fn pending_connect_does_not_stall_events_or_shutdown() {
        let mut trainer = LoopbackPeripheral::new("AA:BB:CC:00:00:0A", Some("KICKR CORE"))
            .with_service(gatt::FITNESS_MACHINE_SERVICE, gatt::INDOOR_BIKE_DATA);
        trainer.hangs_on_connect = true;
        let (addr, fanout, cancel, handle) = start_server_with(trainer).await;
        let (ws, _) = connect_async(format!("ws://{addr}")).await.unwrap();
        let (mut sink, mut source) = ws.split();

        sink.send(Message::text(
            r#"{"type":"subscribe","topic":"device-events","request_id":1}"#,
        ))
        .await
        .unwrap();
        sink.send(Message::text(r#"{"type":"start-scanning","request_id":2}"#))
            .await
            .unwrap();
        wait_json(&mut source, |m| m["event"]["type"] == "device-discovered").await;

        sink.send(Message::text(
            r#"{"type":"connect-device","device_id":"ble:aa:bb:cc:00:00:0a","request_id":3}"#,
        ))
        .await
        .unwrap();
        let connecting = wait_json(&mut source, |m| {
            m["event"]["type"] == "device-status" || m["request_id"] == 3
        })
        .await;
        assert_eq!(connecting["event"]["state"], "connecting");

        cancel.cancel();
        let closed = tokio::time::timeout(Duration::from_secs(3), async {
            while let Some(Ok(msg)) = source.next().await {
                if msg.is_close() {
                    return true;
                }
            }
            false
        })
        .await
        .unwrap();
        assert!(closed);
        tokio::time::timeout(Duration::from_secs(3), handle)
            .await
            .unwrap()
            .unwrap();
        fanout.aggregator().shutdown().await;
    }
}
