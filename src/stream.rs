//! Framed BGAPI packet stream over a serial byte stream
//!
//! A dedicated reader thread turns the raw byte stream into whole packets:
//! it accumulates exactly one header, decodes the payload length, reads
//! exactly that many payload bytes, and hands the packet to the consumer
//! channel. Short reads and read timeouts are normal on a serial line and
//! are simply retried; the reader never delivers a partial packet. When the
//! stream ends, dies, or is stopped, a terminal `Closed` sentinel is
//! enqueued so every consumer can exit.

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::protocol::{self, BgapiPacket, HEADER_LENGTH};

/// Item delivered by the reader thread
#[derive(Debug)]
pub enum StreamItem {
    Packet(BgapiPacket),
    /// Terminal sentinel: the byte stream ended or the stream was stopped
    Closed,
}

/// Packet-framing wrapper around a serial byte stream
pub struct PacketStream {
    writer: Mutex<Box<dyn Write + Send>>,
    shutdown: Arc<AtomicBool>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl PacketStream {
    /// Spawn the reader thread and return the stream plus the packet channel
    pub fn new(
        reader: Box<dyn Read + Send>,
        writer: Box<dyn Write + Send>,
    ) -> (Self, Receiver<StreamItem>) {
        let (tx, rx) = mpsc::channel();
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        let handle = thread::Builder::new()
            .name("bled112-reader".into())
            .spawn(move || read_loop(reader, tx, flag))
            .expect("failed to spawn packet reader thread");

        let stream = Self {
            writer: Mutex::new(writer),
            shutdown,
            reader: Mutex::new(Some(handle)),
        };
        (stream, rx)
    }

    /// Write one whole packet. Atomic at packet granularity.
    pub fn write_packet(&self, packet: &BgapiPacket) -> io::Result<()> {
        let bytes = packet.encode();
        let mut writer = self.writer.lock();
        writer.write_all(&bytes)?;
        writer.flush()
    }

    /// Stop the reader thread. Idempotent; consumers see `StreamItem::Closed`.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.reader.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for PacketStream {
    fn drop(&mut self) {
        self.stop();
    }
}

enum Fill {
    Complete,
    Stopped,
    Dead,
}

/// Read exactly `buf.len()` bytes, tolerating timeouts and short reads
fn fill<R: Read + ?Sized>(port: &mut R, buf: &mut [u8], shutdown: &AtomicBool) -> Fill {
    let mut have = 0;
    while have < buf.len() {
        if shutdown.load(Ordering::Relaxed) {
            return Fill::Stopped;
        }
        match port.read(&mut buf[have..]) {
            Ok(0) => return Fill::Dead,
            Ok(n) => have += n,
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                continue;
            }
            Err(e) => {
                warn!("serial read failed: {}", e);
                return Fill::Dead;
            }
        }
    }
    Fill::Complete
}

fn read_loop(mut port: Box<dyn Read + Send>, tx: Sender<StreamItem>, shutdown: Arc<AtomicBool>) {
    debug!("packet reader thread started");

    loop {
        let mut header = [0u8; HEADER_LENGTH];
        match fill(&mut *port, &mut header, &shutdown) {
            Fill::Complete => {}
            Fill::Stopped | Fill::Dead => break,
        }

        let length = protocol::payload_length(&header);
        let mut payload = vec![0u8; length];
        match fill(&mut *port, &mut payload, &shutdown) {
            Fill::Complete => {}
            Fill::Stopped | Fill::Dead => break,
        }

        let packet = BgapiPacket::from_wire(&header, payload);
        if tx.send(StreamItem::Packet(packet)).is_err() {
            // Consumer is gone; nothing left to do.
            break;
        }
    }

    let _ = tx.send(StreamItem::Closed);
    debug!("packet reader thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::time::Duration;

    /// Byte source that hands out scripted chunks, then reports EOF.
    /// Models a serial port that coalesces and splits packets arbitrarily.
    struct ChunkedReader {
        chunks: VecDeque<Vec<u8>>,
    }

    impl Read for ChunkedReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.chunks.front_mut() {
                None => Ok(0),
                Some(chunk) => {
                    let n = chunk.len().min(buf.len());
                    buf[..n].copy_from_slice(&chunk[..n]);
                    chunk.drain(..n);
                    if chunk.is_empty() {
                        self.chunks.pop_front();
                    }
                    Ok(n)
                }
            }
        }
    }

    fn stream_over(chunks: Vec<Vec<u8>>) -> (PacketStream, Receiver<StreamItem>) {
        let reader = ChunkedReader {
            chunks: chunks.into(),
        };
        PacketStream::new(Box::new(reader), Box::new(io::sink()))
    }

    fn expect_packet(rx: &Receiver<StreamItem>) -> BgapiPacket {
        match rx.recv_timeout(Duration::from_secs(1)).unwrap() {
            StreamItem::Packet(p) => p,
            other => panic!("expected packet, got {:?}", other),
        }
    }

    #[test]
    fn test_two_packets_in_one_chunk() {
        let mut bytes = BgapiPacket::event(6, 0, vec![1, 2, 3]).encode();
        bytes.extend(BgapiPacket::command(0, 6, vec![]).encode());
        let (_stream, rx) = stream_over(vec![bytes]);

        let first = expect_packet(&rx);
        assert!(first.is_event);
        assert_eq!(first.payload, vec![1, 2, 3]);

        let second = expect_packet(&rx);
        assert!(!second.is_event);
        assert!(second.matches(0, 6));

        assert!(matches!(
            rx.recv_timeout(Duration::from_secs(1)).unwrap(),
            StreamItem::Closed
        ));
    }

    #[test]
    fn test_packet_split_across_reads() {
        let bytes = BgapiPacket::event(3, 4, vec![4, 0x16, 0x02]).encode();
        let chunks = bytes.iter().map(|b| vec![*b]).collect();
        let (_stream, rx) = stream_over(chunks);

        let packet = expect_packet(&rx);
        assert!(packet.matches(3, 4));
        assert_eq!(packet.payload, vec![4, 0x16, 0x02]);
    }

    #[test]
    fn test_eof_emits_closed_sentinel() {
        let (_stream, rx) = stream_over(vec![]);
        assert!(matches!(
            rx.recv_timeout(Duration::from_secs(1)).unwrap(),
            StreamItem::Closed
        ));
    }

    #[test]
    fn test_stop_is_idempotent() {
        // A reader blocked on timeouts must unblock promptly on stop.
        struct Quiet;
        impl Read for Quiet {
            fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
                std::thread::sleep(Duration::from_millis(1));
                Err(io::Error::new(io::ErrorKind::TimedOut, "timed out"))
            }
        }

        let (stream, rx) = PacketStream::new(Box::new(Quiet), Box::new(io::sink()));
        stream.stop();
        stream.stop();
        assert!(matches!(
            rx.recv_timeout(Duration::from_secs(1)).unwrap(),
            StreamItem::Closed
        ));
    }
}
