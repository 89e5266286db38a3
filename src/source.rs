//! Pub/sub frame transport
//!
//! The camera bus is consumed through the [`FrameSource`] abstraction: a
//! subscribe-style connection yielding one bounded-wait receive per call.
//! The wire format is a 4-byte big-endian length prefix followed by the
//! payload; a subscriber's first frame names its topic, after which the
//! publisher streams encoded [`CameraSample`]s whose topic matches by
//! prefix. Subscribers that cannot keep up are dropped, never queued.

use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::error::{GatewayError, Result};
use crate::video::frame::CameraSample;

/// Largest frame accepted off the bus (64 MB)
const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Read timeout while waiting for a fresh subscriber to name its topic
const SUBSCRIBE_TIMEOUT: Duration = Duration::from_millis(250);

/// Write timeout before a slow subscriber is dropped
const PUBLISH_TIMEOUT: Duration = Duration::from_millis(50);

/// Errors from a frame source receive
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("timed out waiting for frame")]
    Timeout,

    #[error("source disconnected: {0}")]
    Disconnected(String),

    #[error("bad frame payload: {0}")]
    Decode(String),
}

/// One subscription on the camera bus
pub trait FrameSource: Send {
    /// Wait up to `timeout` for the next frame
    fn recv_timeout(&mut self, timeout: Duration) -> std::result::Result<CameraSample, SourceError>;
}

/// Factory for frame sources; `connect` may block on a network round trip
pub trait SourceConnector: Send + Sync {
    fn connect(&self, address: &str, topic: &str) -> Result<Box<dyn FrameSource>>;
}

/// Connector producing TCP subscribers
#[derive(Debug, Default)]
pub struct TcpSourceConnector;

impl SourceConnector for TcpSourceConnector {
    fn connect(&self, address: &str, topic: &str) -> Result<Box<dyn FrameSource>> {
        Ok(Box::new(TcpSubscriber::connect(address, topic)?))
    }
}

fn parse_address(address: &str) -> Result<&str> {
    address
        .strip_prefix("tcp://")
        .ok_or_else(|| GatewayError::Source(format!("unsupported source address: {address}")))
}

fn write_frame(stream: &mut TcpStream, payload: &[u8]) -> io::Result<()> {
    stream.write_all(&(payload.len() as u32).to_be_bytes())?;
    stream.write_all(payload)
}

fn read_frame(stream: &mut TcpStream) -> io::Result<BytesMut> {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header)?;
    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit"),
        ));
    }
    let mut payload = BytesMut::zeroed(len);
    stream.read_exact(&mut payload)?;
    Ok(payload)
}

/// Subscription to one topic over TCP
pub struct TcpSubscriber {
    stream: TcpStream,
    topic: String,
}

impl TcpSubscriber {
    /// Connect and subscribe; blocks on the TCP round trip
    pub fn connect(address: &str, topic: &str) -> Result<Self> {
        let host = parse_address(address)?;
        let mut stream = TcpStream::connect(host)
            .map_err(|e| GatewayError::Source(format!("cannot connect to {address}: {e}")))?;
        let _ = stream.set_nodelay(true);
        write_frame(&mut stream, topic.as_bytes())
            .map_err(|e| GatewayError::Source(format!("cannot subscribe to {topic}: {e}")))?;
        debug!("subscribed to {} on {}", topic, address);
        Ok(Self {
            stream,
            topic: topic.to_string(),
        })
    }

    /// Topic this subscriber filters on
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

impl FrameSource for TcpSubscriber {
    fn recv_timeout(&mut self, timeout: Duration) -> std::result::Result<CameraSample, SourceError> {
        self.stream
            .set_read_timeout(Some(timeout))
            .map_err(|e| SourceError::Disconnected(e.to_string()))?;

        let payload = read_frame(&mut self.stream).map_err(|e| match e.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => SourceError::Timeout,
            _ => SourceError::Disconnected(e.to_string()),
        })?;

        CameraSample::decode(payload.freeze()).map_err(|e| SourceError::Decode(e.to_string()))
    }
}

struct Subscriber {
    stream: TcpStream,
    topic: String,
}

/// Publishing side of the camera bus, used by demo publishers and tests
pub struct FramePublisher {
    listener: TcpListener,
    subscribers: Vec<Subscriber>,
}

impl FramePublisher {
    /// Bind the publish endpoint
    pub fn bind(address: &str) -> Result<Self> {
        let host = parse_address(address)?;
        let listener = TcpListener::bind(host)
            .map_err(|e| GatewayError::Source(format!("cannot bind {address}: {e}")))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| GatewayError::Source(e.to_string()))?;
        info!("publishing frames on {}", address);
        Ok(Self {
            listener,
            subscribers: Vec::new(),
        })
    }

    /// Address the publisher is bound to
    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| GatewayError::Source(e.to_string()))
    }

    /// Number of live subscriptions
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    fn accept_pending(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((mut stream, peer)) => {
                    if stream.set_read_timeout(Some(SUBSCRIBE_TIMEOUT)).is_err() {
                        continue;
                    }
                    match read_frame(&mut stream) {
                        Ok(raw) => match String::from_utf8(raw.to_vec()) {
                            Ok(topic) => {
                                debug!("subscriber {} joined topic {}", peer, topic);
                                let _ = stream.set_write_timeout(Some(PUBLISH_TIMEOUT));
                                self.subscribers.push(Subscriber { stream, topic });
                            }
                            Err(_) => warn!("subscriber {} sent a non-utf8 topic", peer),
                        },
                        Err(e) => warn!("subscriber {} failed to subscribe: {}", peer, e),
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("accept failed: {}", e);
                    break;
                }
            }
        }
    }

    /// Send one sample to every subscriber whose subscription prefixes `topic`.
    /// A subscriber that errors or cannot keep up is dropped.
    pub fn publish(&mut self, topic: &str, sample: &CameraSample) {
        self.accept_pending();

        let payload: Bytes = sample.encode();
        self.subscribers.retain_mut(|sub| {
            if !topic.starts_with(&sub.topic) {
                return true;
            }
            match write_frame(&mut sub.stream, &payload) {
                Ok(()) => true,
                Err(e) => {
                    debug!("dropping subscriber on topic {}: {}", sub.topic, e);
                    false
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::frame::PixelFormat;

    fn test_sample(value: u8) -> CameraSample {
        CameraSample::packed(4, 4, PixelFormat::Luminance, Bytes::from(vec![value; 16]))
    }

    fn bind_local() -> (FramePublisher, String) {
        let publisher = FramePublisher::bind("tcp://127.0.0.1:0").unwrap();
        let addr = format!("tcp://{}", publisher.local_addr().unwrap());
        (publisher, addr)
    }

    #[test]
    fn delivers_published_frames() {
        let (mut publisher, addr) = bind_local();
        let mut sub = TcpSubscriber::connect(&addr, "camera").unwrap();

        publisher.publish("camera.front", &test_sample(42));
        let sample = sub.recv_timeout(Duration::from_millis(500)).unwrap();
        assert_eq!(sample.data[0], 42);
        assert_eq!(publisher.subscriber_count(), 1);
    }

    #[test]
    fn times_out_when_idle() {
        let (mut publisher, addr) = bind_local();
        let mut sub = TcpSubscriber::connect(&addr, "camera").unwrap();
        // drain the accept queue so the subscription is registered
        publisher.publish("other", &test_sample(0));

        match sub.recv_timeout(Duration::from_millis(50)) {
            Err(SourceError::Timeout) => {}
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[test]
    fn filters_by_topic_prefix() {
        let (mut publisher, addr) = bind_local();
        let mut sub = TcpSubscriber::connect(&addr, "camera.front").unwrap();

        publisher.publish("camera.rear", &test_sample(1));
        publisher.publish("camera.front", &test_sample(2));

        let sample = sub.recv_timeout(Duration::from_millis(500)).unwrap();
        assert_eq!(sample.data[0], 2);
    }

    #[test]
    fn detects_disconnect() {
        let (publisher, addr) = bind_local();
        let mut sub = TcpSubscriber::connect(&addr, "camera").unwrap();
        drop(publisher);

        match sub.recv_timeout(Duration::from_millis(200)) {
            Err(SourceError::Disconnected(_)) => {}
            other => panic!("expected disconnect, got {other:?}"),
        }
    }

    #[test]
    fn rejects_bad_address_scheme() {
        assert!(TcpSubscriber::connect("udp://127.0.0.1:1", "t").is_err());
    }
}
