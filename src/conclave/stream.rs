//! Reader and writer loops binding the frame codec to a duplex stream.

use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{Receiver, Sender};
use serde_json::Value;

use super::frame::{FrameDecoder, FrameEncoder, FrameError, FrameEvent};

const READ_BUF_LEN: usize = 8 * 1024;
const WRITE_RETRY_PAUSE: Duration = Duration::from_millis(2);

/// A duplex byte stream the wire connection can split and tear down.
///
/// Implementations hand out a second handle for the reader thread and
/// support shutting down both directions, which is how an in-flight
/// blocking read is interrupted. TLS wrappers implement this on top of
/// their platform stream.
pub trait SessionStream: Read + Write + Send + Sized + 'static {
    fn split(&self) -> std::io::Result<Self>;
    fn shutdown(&self) -> std::io::Result<()>;
}

impl SessionStream for TcpStream {
    fn split(&self) -> std::io::Result<Self> {
        self.try_clone()
    }

    fn shutdown(&self) -> std::io::Result<()> {
        TcpStream::shutdown(self, Shutdown::Both)
    }
}

/// Inbound handoff from the reader thread, in stream order.
#[derive(Debug)]
pub enum ReaderEvent {
    /// The stream is open and the read loop is live.
    Open,
    Frame(FrameEvent),
    /// Terminal: end of stream (`None`) or a fatal stream error. Emitted
    /// exactly once.
    Closed(Option<FrameError>),
}

/// Commands accepted by the writer thread.
#[derive(Debug)]
pub enum WriterCommand {
    /// Frame and send one value; `None` sends the bare-delimiter heartbeat.
    Send(Option<Value>),
    Shutdown,
}

/// Spawn the read loop: blocking reads feeding the decoder, decoded frames
/// forwarded in order. The loop ends on EOF, stream error, or when the
/// receiving side goes away.
pub fn spawn_reader<R>(
    mut source: R,
    mut decoder: FrameDecoder,
    tx: Sender<ReaderEvent>,
) -> JoinHandle<()>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        if tx.send(ReaderEvent::Open).is_err() {
            return;
        }
        let mut scratch = [0u8; READ_BUF_LEN];
        loop {
            match source.read(&mut scratch) {
                Ok(0) => {
                    let _ = tx.send(ReaderEvent::Closed(None));
                    return;
                }
                Ok(n) => match decoder.feed(&scratch[..n]) {
                    Ok(events) => {
                        for event in events {
                            if tx.send(ReaderEvent::Frame(event)).is_err() {
                                return;
                            }
                        }
                    }
                    Err(err) => {
                        let _ = tx.send(ReaderEvent::Closed(Some(err)));
                        return;
                    }
                },
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    let _ = tx.send(ReaderEvent::Closed(Some(err.into())));
                    return;
                }
            }
        }
    })
}

/// Spawn the write loop: encode each command onto the pending buffer and
/// drain it, resuming after partial writes. The first fatal error is
/// reported once on `error_tx` and ends the loop.
pub fn spawn_writer<W>(
    mut sink: W,
    mut encoder: FrameEncoder,
    rx: Receiver<WriterCommand>,
    error_tx: Sender<FrameError>,
) -> JoinHandle<()>
where
    W: Write + Send + 'static,
{
    thread::spawn(move || {
        loop {
            let command = match rx.recv() {
                Ok(command) => command,
                Err(_) => return,
            };
            let value = match command {
                WriterCommand::Send(value) => value,
                WriterCommand::Shutdown => return,
            };

            if let Err(err) = encoder.enqueue(value.as_ref()) {
                let _ = error_tx.send(err);
                return;
            }
            if let Err(err) = drain_pending(&mut encoder, &mut sink) {
                let _ = error_tx.send(err.into());
                return;
            }
        }
    })
}

/// Drain the pending buffer through the sink, in order, without loss or
/// duplication. Insufficient sink space just means "try again"; only real
/// I/O failures escape.
fn drain_pending<W: Write>(encoder: &mut FrameEncoder, sink: &mut W) -> std::io::Result<()> {
    while !encoder.is_idle() {
        match encoder.write_pending(sink) {
            Ok(0) => {
                return Err(std::io::Error::new(
                    ErrorKind::WriteZero,
                    "sink accepted no bytes",
                ));
            }
            Ok(_) => {}
            Err(err) if err.kind() == ErrorKind::Interrupted => {}
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                thread::sleep(WRITE_RETRY_PAUSE);
            }
            Err(err) => return Err(err),
        }
    }
    sink.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Cursor;

    const MAX: usize = 1024 * 1024;

    #[test]
    fn reader_emits_open_frames_then_one_close() {
        let bytes = b"{\"hello\":{\"bufferSize\":512,\"heartbeat\":60}}\n\n".to_vec();
        let (tx, rx) = crossbeam::channel::unbounded();
        let handle = spawn_reader(Cursor::new(bytes), FrameDecoder::new(false, MAX), tx);
        handle.join().unwrap();

        let events: Vec<ReaderEvent> = rx.iter().collect();
        assert_eq!(events.len(), 4);
        assert!(matches!(events[0], ReaderEvent::Open));
        assert!(matches!(events[1], ReaderEvent::Frame(FrameEvent::Value(_))));
        assert!(matches!(
            events[2],
            ReaderEvent::Frame(FrameEvent::Heartbeat)
        ));
        assert!(matches!(events[3], ReaderEvent::Closed(None)));
    }

    #[test]
    fn reader_stops_when_receiver_dropped() {
        let bytes = b"\n\n\n\n".to_vec();
        let (tx, rx) = crossbeam::channel::unbounded();
        drop(rx);
        let handle = spawn_reader(Cursor::new(bytes), FrameDecoder::new(false, MAX), tx);
        handle.join().unwrap();
    }

    struct FlakySink {
        accepted: Vec<u8>,
        call: usize,
    }

    impl Write for FlakySink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.call += 1;
            if self.call % 2 == 1 {
                return Err(std::io::Error::new(ErrorKind::WouldBlock, "not ready"));
            }
            let n = buf.len().min(3);
            self.accepted.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn drain_retries_past_would_block_until_complete() {
        let mut encoder = FrameEncoder::new(false, MAX);
        encoder.enqueue(Some(&json!({"bye": {}}))).unwrap();
        let mut sink = FlakySink {
            accepted: Vec::new(),
            call: 0,
        };
        drain_pending(&mut encoder, &mut sink).unwrap();
        assert_eq!(sink.accepted, b"{\"bye\":{}}\n");
        assert!(encoder.is_idle());
    }

    #[test]
    fn writer_reports_fatal_error_once_and_exits() {
        struct DeadSink;
        impl Write for DeadSink {
            fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
                Err(std::io::Error::new(ErrorKind::BrokenPipe, "gone"))
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let (cmd_tx, cmd_rx) = crossbeam::channel::unbounded();
        let (err_tx, err_rx) = crossbeam::channel::unbounded();
        let handle = spawn_writer(DeadSink, FrameEncoder::new(false, MAX), cmd_rx, err_tx);

        cmd_tx
            .send(WriterCommand::Send(Some(json!({"who": {}}))))
            .unwrap();
        let err = err_rx
            .recv_timeout(Duration::from_secs(1))
            .expect("writer error");
        assert!(matches!(err, FrameError::Io(_)));
        handle.join().unwrap();
        assert!(err_rx.try_recv().is_err());
    }

    #[test]
    fn writer_shutdown_is_clean() {
        let (cmd_tx, cmd_rx) = crossbeam::channel::unbounded();
        let (err_tx, err_rx) = crossbeam::channel::unbounded();
        let handle = spawn_writer(Vec::new(), FrameEncoder::new(false, MAX), cmd_rx, err_tx);

        cmd_tx.send(WriterCommand::Send(None)).unwrap();
        cmd_tx.send(WriterCommand::Shutdown).unwrap();
        handle.join().unwrap();
        assert!(err_rx.try_recv().is_err());
    }
}
