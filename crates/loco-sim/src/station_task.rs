//! Virtual command station task
//!
//! Owns a [`VirtualCommandStation`] and serves it over an async stream,
//! usually one end of `tokio::io::duplex()`. A control channel lets tests
//! flip behaviour switches or play another throttle on the layout while the
//! connection is running.

use loco_protocol::LocoState;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::{SimError, VirtualCommandStation};

/// Commands that can be sent to a running virtual station
#[derive(Debug)]
pub enum StationCommand {
    /// Stop or resume answering frames
    SetSilent(bool),
    /// Refuse or accept acquisitions
    SetRejectAcquisitions(bool),
    /// Mark an address as owned elsewhere
    SetSlotInUse { number: u16, in_use: bool },
    /// Drive a locomotive from another (simulated) throttle
    Operate { number: u16, state: LocoState },
    /// Report track power off
    PowerOff,
    /// Number of frames received so far
    FrameCount(oneshot::Sender<usize>),
    /// Station's view of a locomotive
    LocoState {
        number: u16,
        reply: oneshot::Sender<Option<LocoState>>,
    },
    /// Stop the task
    Shutdown,
}

/// Serve `station` over `stream` until the stream closes or shutdown
///
/// Returns the station so callers can inspect what it received. A closed
/// control channel is not a shutdown; the station keeps answering.
pub async fn run_virtual_station<S>(
    mut stream: S,
    mut station: VirtualCommandStation,
    mut cmd_rx: mpsc::Receiver<StationCommand>,
) -> Result<VirtualCommandStation, SimError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = [0u8; 1024];
    let mut commands_open = true;

    info!(
        "Starting virtual station {} ({})",
        station.id(),
        station.protocol().name()
    );

    loop {
        tokio::select! {
            result = stream.read(&mut buf) => {
                match result {
                    Ok(0) => {
                        debug!("Virtual station stream closed for {}", station.id());
                        break;
                    }
                    Ok(n) => station.process_bytes(&buf[..n]),
                    Err(e) => {
                        warn!("Virtual station {} stream error: {}", station.id(), e);
                        return Err(e.into());
                    }
                }
            }

            cmd = cmd_rx.recv(), if commands_open => {
                match cmd {
                    Some(StationCommand::SetSilent(silent)) => station.set_silent(silent),
                    Some(StationCommand::SetRejectAcquisitions(reject)) => {
                        station.set_reject_acquisitions(reject)
                    }
                    Some(StationCommand::SetSlotInUse { number, in_use }) => {
                        station.set_slot_in_use(number, in_use)
                    }
                    Some(StationCommand::Operate { number, state }) => {
                        if let Err(e) = station.operate(number, state) {
                            warn!("Virtual station {}: {}", station.id(), e);
                        }
                    }
                    Some(StationCommand::PowerOff) => station.power_off(),
                    Some(StationCommand::FrameCount(reply)) => {
                        let _ = reply.send(station.frame_count());
                    }
                    Some(StationCommand::LocoState { number, reply }) => {
                        let _ = reply.send(station.loco_state(number));
                    }
                    Some(StationCommand::Shutdown) => {
                        info!("Shutdown requested for virtual station {}", station.id());
                        break;
                    }
                    None => commands_open = false,
                }
            }
        }

        while let Some(frame) = station.take_output() {
            stream.write_all(&frame).await?;
        }
        stream.flush().await?;
    }

    info!("Virtual station task ended for {}", station.id());
    Ok(station)
}

#[cfg(test)]
mod tests {
    use super::*;
    use loco_protocol::Protocol;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_serves_stream_until_closed() {
        let (mut client, server) = duplex(256);
        let (_tx, rx) = mpsc::channel(4);
        let task = tokio::spawn(run_virtual_station(
            server,
            VirtualCommandStation::new("EX", Protocol::DccEx),
            rx,
        ));

        client.write_all(b"<t 3 0 1>").await.unwrap();
        let mut buf = [0u8; 64];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"<l 3 0 128 0>");

        drop(client);
        let station = task.await.unwrap().unwrap();
        assert_eq!(station.frame_count(), 1);
    }

    #[tokio::test]
    async fn test_control_channel() {
        let (mut client, server) = duplex(256);
        let (tx, rx) = mpsc::channel(4);
        let task = tokio::spawn(run_virtual_station(
            server,
            VirtualCommandStation::new("EX", Protocol::DccEx),
            rx,
        ));

        tx.send(StationCommand::SetSilent(true)).await.unwrap();
        client.write_all(b"<t 3 5 1>").await.unwrap();
        let (reply, count) = oneshot::channel();
        tx.send(StationCommand::FrameCount(reply)).await.unwrap();
        // the count may be taken before the frame is read; poll until it lands
        let mut seen = count.await.unwrap();
        while seen == 0 {
            tokio::task::yield_now().await;
            let (reply, count) = oneshot::channel();
            tx.send(StationCommand::FrameCount(reply)).await.unwrap();
            seen = count.await.unwrap();
        }
        assert_eq!(seen, 1);

        tx.send(StationCommand::Shutdown).await.unwrap();
        let station = task.await.unwrap().unwrap();
        assert_eq!(station.loco_state(3), None);
    }
}
