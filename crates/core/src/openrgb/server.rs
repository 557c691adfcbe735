//! TCP listener for the external color target. One client is served at a
//! time; a malformed packet closes that client and the listener carries on.

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

use super::protocol::{self, packet, Header, HEADER_LEN};
use super::ExternalTarget;
use crate::error::{Error, Result};
use crate::task;

/// Bind the listener on `address:port`.
pub async fn bind(address: &str, port: u16) -> Result<TcpListener> {
    let listener = TcpListener::bind((address, port)).await?;
    info!(address, port, "external color target listening");
    Ok(listener)
}

/// Answer one request. Returns the reply packet, if the request has one.
pub fn handle_packet(target: &ExternalTarget, header: &Header, payload: &[u8]) -> Result<Option<Vec<u8>>> {
    let id = header.device_id;
    let reply = match header.packet_type {
        packet::REQUEST_CONTROLLER_COUNT => Some(protocol::frame(
            0,
            packet::REQUEST_CONTROLLER_COUNT,
            &protocol::controller_count(target.len() as u32),
        )),
        packet::REQUEST_CONTROLLER_DATA => {
            let controller = controller(target, id)?;
            Some(protocol::frame(
                id,
                packet::REQUEST_CONTROLLER_DATA,
                &protocol::controller_data(&controller),
            ))
        }
        packet::REQUEST_PROTOCOL_VERSION => Some(protocol::frame(
            0,
            packet::REQUEST_PROTOCOL_VERSION,
            &protocol::protocol_version(),
        )),
        packet::SET_CLIENT_NAME => {
            let name = protocol::client_name(payload);
            info!(client = %name, "external client named");
            target.set_client_name(name);
            None
        }
        packet::UPDATE_LEDS => {
            let colors = protocol::update_leds(payload)?;
            controller(target, id)?.update(&colors);
            None
        }
        packet::UPDATE_ZONE_LEDS => {
            let (zone, colors) = protocol::update_zone_leds(payload)?;
            controller(target, id)?.update_zone(zone as usize, &colors);
            None
        }
        packet::UPDATE_SINGLE_LED => {
            let (index, color) = protocol::update_single_led(payload)?;
            controller(target, id)?.update_led(index as usize, color);
            None
        }
        packet::SET_CUSTOM_MODE | packet::UPDATE_MODE => {
            debug!(device_id = id, "mode change acknowledged, staying in Direct");
            None
        }
        other => {
            debug!(packet_type = other, size = header.size, "ignoring packet");
            None
        }
    };
    Ok(reply)
}

fn controller(target: &ExternalTarget, id: u32) -> Result<Arc<super::ExternalController>> {
    target
        .controller(id)
        .ok_or_else(|| Error::Protocol(format!("unknown controller {id}")))
}

/// Next packet, or `None` on an orderly close.
async fn read_packet(reader: &mut OwnedReadHalf) -> Result<Option<(Header, Vec<u8>)>> {
    let mut raw = [0u8; HEADER_LEN];
    match reader.read_exact(&mut raw).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let header = Header::decode(&raw)?;
    let mut payload = vec![0u8; header.size as usize];
    reader.read_exact(&mut payload).await?;
    trace!(
        packet_type = header.packet_type,
        device_id = header.device_id,
        size = header.size,
        "external RX"
    );
    Ok(Some((header, payload)))
}

async fn handle_client(target: &ExternalTarget, stream: TcpStream, cancel: &mut watch::Receiver<bool>) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(error = %e, "nodelay not set");
    }
    let (mut reader, mut writer) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    target.attach(tx.clone());
    let writer_task = tokio::spawn(async move {
        while let Some(packet) = rx.recv().await {
            if let Err(e) = writer.write_all(&packet).await {
                debug!(error = %e, "external client write failed");
                break;
            }
        }
    });

    loop {
        let next = tokio::select! {
            read = read_packet(&mut reader) => Some(read),
            _ = task::cancelled(cancel) => None,
        };
        let packet = match next {
            None | Some(Ok(None)) => break,
            Some(Ok(Some(packet))) => packet,
            Some(Err(e)) => {
                warn!(error = %e, "closing external client");
                break;
            }
        };
        match handle_packet(target, &packet.0, &packet.1) {
            Ok(Some(reply)) => {
                if tx.send(reply).is_err() {
                    break;
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "closing external client");
                break;
            }
        }
    }

    target.detach();
    drop(tx);
    if let Err(e) = writer_task.await {
        warn!(error = %e, "external writer ended abnormally");
    }
}

/// Accept and serve clients one at a time until cancelled.
pub async fn serve(target: Arc<ExternalTarget>, listener: TcpListener, mut cancel: watch::Receiver<bool>) {
    loop {
        let accepted = tokio::select! {
            r = listener.accept() => Some(r),
            _ = task::cancelled(&mut cancel) => None,
        };
        let Some(result) = accepted else {
            break;
        };
        match result {
            Ok((stream, peer)) => {
                info!(%peer, "external client connected");
                handle_client(&target, stream, &mut cancel).await;
                info!(%peer, "external client disconnected");
            }
            Err(e) => warn!(error = %e, "accept failed"),
        }
    }
    debug!("external color target stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::openrgb::{DeviceType, ExternalController, ExternalZone};
    use crate::sink::ColorSink;
    use crate::task::Shutdown;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Capture {
        frames: Mutex<Vec<Vec<u8>>>,
    }

    impl ColorSink for Capture {
        fn write(&self, buffer: &[u8], _channel: u8) -> bool {
            self.frames.lock().push(buffer.to_vec());
            true
        }
    }

    fn target_with(sink: Arc<Capture>) -> Arc<ExternalTarget> {
        let target = Arc::new(ExternalTarget::new());
        target.register(Arc::new(ExternalController::new(
            DeviceType::LedStrip,
            "Strip",
            "S1",
            "1.0",
            vec![ExternalZone::linear("Strip", 3)],
            sink,
        )));
        target
    }

    #[test]
    fn count_and_version_replies() {
        let target = target_with(Arc::new(Capture::default()));
        let reply = handle_packet(&target, &Header::new(0, 0, 0), &[]).unwrap().unwrap();
        assert_eq!(reply.len(), 20);
        assert_eq!(&reply[16..], &[1, 0, 0, 0]);

        let reply = handle_packet(&target, &Header::new(0, 40, 0), &[]).unwrap().unwrap();
        assert_eq!(&reply[12..16], &[4, 0, 0, 0]);
        assert_eq!(&reply[16..], &[4, 0, 0, 0]);
    }

    #[test]
    fn unknown_controller_is_an_error() {
        let target = target_with(Arc::new(Capture::default()));
        assert!(handle_packet(&target, &Header::new(7, 1, 0), &[]).is_err());
        assert!(handle_packet(&target, &Header::new(0, 1, 0), &[]).unwrap().is_some());
    }

    #[test]
    fn unknown_packets_are_ignored() {
        let target = target_with(Arc::new(Capture::default()));
        assert!(handle_packet(&target, &Header::new(0, 9999, 0), &[]).unwrap().is_none());
        assert!(handle_packet(&target, &Header::new(0, 1101, 0), &[]).unwrap().is_none());
    }

    #[tokio::test]
    async fn tcp_session_and_malformed_close() {
        let sink = Arc::new(Capture::default());
        let target = target_with(Arc::clone(&sink));
        let listener = bind("127.0.0.1", 0).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = Shutdown::new();
        let server = tokio::spawn(serve(Arc::clone(&target), listener, shutdown.subscribe()));

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&protocol::frame(0, 50, b"tester\0")).await.unwrap();
        client.write_all(&protocol::frame(0, 40, &[])).await.unwrap();
        let mut reply = [0u8; 20];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply[..4], b"ORGB");
        assert_eq!(&reply[16..], &[4, 0, 0, 0]);
        assert_eq!(target.client_name(), "tester");

        let mut leds = vec![18, 0, 0, 0, 3, 0];
        leds.extend_from_slice(&[1, 2, 3, 0, 4, 5, 6, 0, 7, 8, 9, 0]);
        client.write_all(&protocol::frame(0, 1050, &leds)).await.unwrap();
        client.write_all(b"JUNKJUNKJUNKJUNK").await.unwrap();
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        assert_eq!(
            sink.frames.lock().last().unwrap(),
            &vec![1, 2, 3, 4, 5, 6, 7, 8, 9]
        );

        shutdown.trigger();
        server.await.unwrap();
    }
}
