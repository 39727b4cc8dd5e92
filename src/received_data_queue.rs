use crate::freeze::{Defroster, Freezer};
use crate::packet::TrafficClass;
use crate::packet_wrapper::PacketWrapper;
use anyhow::{anyhow, bail};
use bytes::Bytes;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::trace;

/// A message that was received completely and is waiting for the application to pick it up
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReassembledMessage {
    pub class: TrafficClass,
    pub tag: u16,
    /// the data of the message's fragments, in order
    pub fragments: Vec<Bytes>,
}

impl ReassembledMessage {
    /// Collects the data of a complete sequence of packets. Fails if a packet carries no data.
    pub fn from_packets(packets: &[PacketWrapper]) -> anyhow::Result<ReassembledMessage> {
        let first = match packets.first().and_then(|w| w.packet()) {
            Some(p) => p,
            None => bail!("message without packets"),
        };

        let mut fragments = Vec::with_capacity(packets.len());
        for wrapper in packets {
            let (_, payload) = wrapper.packet()
                .and_then(|p| p.data())
                .ok_or_else(|| anyhow!("packet #{} of a message has no data chunk", wrapper.tsn()))?;
            fragments.push(payload.clone());
        }

        Ok(ReassembledMessage {
            class: first.class,
            tag: first.tag(),
            fragments,
        })
    }

    pub fn size(&self) -> usize {
        self.fragments.iter().map(|f| f.len()).sum()
    }

    /// Copies as much of the message as fits into `buf`, returning the number of copied bytes
    pub fn copy_to(&self, buf: &mut [u8]) -> usize {
        self.scatter_to(&mut [buf])
    }

    /// Copies the message into a sequence of buffers, filling each before moving to the next
    pub fn scatter_to(&self, bufs: &mut [&mut [u8]]) -> usize {
        let mut copied = 0;
        let mut target_idx = 0;
        let mut target_offs = 0;

        for fragment in &self.fragments {
            let mut source: &[u8] = fragment;
            while !source.is_empty() {
                while target_idx < bufs.len() && target_offs == bufs[target_idx].len() {
                    target_idx += 1;
                    target_offs = 0;
                }
                if target_idx == bufs.len() {
                    return copied;
                }

                let target = &mut bufs[target_idx][target_offs..];
                let n = target.len().min(source.len());
                target[..n].copy_from_slice(&source[..n]);
                source = &source[n..];
                target_offs += n;
                copied += n;
            }
        }
        copied
    }

    fn freeze(&self, freezer: &mut Freezer) {
        freezer.put_u8(class_to_u8(self.class));
        freezer.put_u32(self.tag.into());
        freezer.put_len(self.fragments.len());
        for fragment in &self.fragments {
            freezer.put_bytes(fragment);
        }
    }

    fn defrost(defroster: &mut Defroster) -> anyhow::Result<ReassembledMessage> {
        let class = class_from_u8(defroster.get_u8()?)?;
        let tag = u16::try_from(defroster.get_u32()?)?;
        let mut fragments = Vec::new();
        for _ in 0..defroster.get_len()? {
            fragments.push(defroster.get_bytes()?);
        }
        Ok(ReassembledMessage { class, tag, fragments })
    }
}

fn class_to_u8(class: TrafficClass) -> u8 {
    TrafficClass::ALL.iter()
        .position(|c| *c == class)
        .unwrap_or_default() as u8
}

fn class_from_u8(value: u8) -> anyhow::Result<TrafficClass> {
    TrafficClass::ALL.get(value as usize)
        .cloned()
        .ok_or_else(|| anyhow!("invalid traffic class {} in frozen image", value))
}

#[derive(Debug, Eq, PartialEq)]
pub enum Waited<T> {
    Ready(T),
    Timeout,
    /// the queue is empty and closed, no more messages will arrive
    Closed,
}

struct ReceivedMessageQueueInner {
    messages: VecDeque<ReassembledMessage>,
    queued_bytes: usize,
    closed: bool,
}

/// Completed messages waiting for the application. Messages of all traffic classes share one
///  queue, in the order in which they were completed.
pub struct ReceivedMessageQueue {
    inner: Mutex<ReceivedMessageQueueInner>,
    changed: Notify,
}

impl Default for ReceivedMessageQueue {
    fn default() -> Self {
        ReceivedMessageQueue::from_messages(VecDeque::new())
    }
}

impl ReceivedMessageQueue {
    fn from_messages(messages: VecDeque<ReassembledMessage>) -> ReceivedMessageQueue {
        let queued_bytes = messages.iter().map(|m| m.size()).sum();
        ReceivedMessageQueue {
            inner: Mutex::new(ReceivedMessageQueueInner {
                messages,
                queued_bytes,
                closed: false,
            }),
            changed: Notify::new(),
        }
    }

    pub async fn insert(&self, message: ReassembledMessage) {
        let mut inner = self.inner.lock().await;
        trace!("message of {} bytes with tag {} available", message.size(), message.tag);
        inner.queued_bytes += message.size();
        inner.messages.push_back(message);
        drop(inner);
        self.changed.notify_waiters();
    }

    /// Waits for the next message and applies `f` to the queue's head while holding the lock.
    ///  `None` as a timeout waits without time limit.
    async fn wait_for_head<R>(&self, timeout: Option<Duration>, mut f: impl FnMut(&mut ReceivedMessageQueueInner) -> R) -> Waited<R> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.inner.lock().await;
                if !inner.messages.is_empty() {
                    return Waited::Ready(f(&mut inner));
                }
                if inner.closed {
                    return Waited::Closed;
                }
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Waited::Timeout;
                    }
                }
                None => notified.await,
            }
        }
    }

    pub async fn extract(&self, timeout: Option<Duration>) -> Waited<ReassembledMessage> {
        let result = self.wait_for_head(timeout, |inner| {
            let message = inner.messages.pop_front();
            if let Some(m) = &message {
                inner.queued_bytes -= m.size();
            }
            message
        }).await;

        match result {
            Waited::Ready(Some(message)) => Waited::Ready(message),
            Waited::Ready(None) => Waited::Closed,
            Waited::Timeout => Waited::Timeout,
            Waited::Closed => Waited::Closed,
        }
    }

    pub async fn next_message_size(&self, timeout: Option<Duration>) -> Waited<usize> {
        self.wait_for_head(timeout, |inner| inner.messages.front().map(|m| m.size()).unwrap_or(0)).await
    }

    pub async fn cumulative_size(&self) -> usize {
        self.inner.lock().await.queued_bytes
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.messages.len()
    }

    /// Messages that are queued already remain available after closing
    pub async fn close(&self) {
        self.inner.lock().await.closed = true;
        self.changed.notify_waiters();
    }

    pub async fn freeze(&self, freezer: &mut Freezer) {
        let inner = self.inner.lock().await;
        freezer.put_len(inner.messages.len());
        for message in &inner.messages {
            message.freeze(freezer);
        }
    }

    pub fn defrost(defroster: &mut Defroster) -> anyhow::Result<ReceivedMessageQueue> {
        let mut messages = VecDeque::new();
        for _ in 0..defroster.get_len()? {
            messages.push_back(ReassembledMessage::defrost(defroster)?);
        }
        Ok(ReceivedMessageQueue::from_messages(messages))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{FragmentPosition, Packet};
    use crate::tsn::Tsn;
    use rstest::rstest;
    use std::sync::Arc;

    fn message(tag: u16, fragments: &[&'static [u8]]) -> ReassembledMessage {
        ReassembledMessage {
            class: TrafficClass::ReliableUnsequenced,
            tag,
            fragments: fragments.iter().map(|f| Bytes::from_static(f)).collect(),
        }
    }

    #[test]
    fn test_from_packets() {
        let now = Instant::now();
        let packets = [(FragmentPosition::First, b"ab" as &[u8]), (FragmentPosition::Last, b"cde")]
            .into_iter()
            .enumerate()
            .map(|(i, (fragment, data))| {
                let mut packet = Packet::new_data(TrafficClass::UnreliableSequenced, fragment, 3, Bytes::copy_from_slice(data));
                packet.tsn = Tsn::from_raw(i as u32);
                PacketWrapper::new(packet, now, 0)
            })
            .collect::<Vec<_>>();

        let message = ReassembledMessage::from_packets(&packets).unwrap();
        assert_eq!(message.class, TrafficClass::UnreliableSequenced);
        assert_eq!(message.tag, 3);
        assert_eq!(message.size(), 5);

        let no_data = vec![PacketWrapper::new(Packet::new_standalone(vec![]), now, 0)];
        assert!(ReassembledMessage::from_packets(&no_data).is_err());
        assert!(ReassembledMessage::from_packets(&[]).is_err());
    }

    #[rstest]
    #[case::fits(10, b"abcdef" as &[u8])]
    #[case::truncated(4, b"abcd" as &[u8])]
    #[case::empty_buffer(0, b"" as &[u8])]
    fn test_copy_to(#[case] buf_len: usize, #[case] expected: &[u8]) {
        let message = message(0, &[b"ab", b"", b"cdef"]);
        let mut buf = vec![0u8; buf_len];
        let n = message.copy_to(&mut buf);
        assert_eq!(&buf[..n], expected);
    }

    #[test]
    fn test_scatter_to() {
        let message = message(0, &[b"abc", b"defg"]);
        let mut a = [0u8; 2];
        let mut b = [0u8; 0];
        let mut c = [0u8; 4];
        let mut d = [0u8; 4];
        let n = message.scatter_to(&mut [&mut a, &mut b, &mut c, &mut d]);
        assert_eq!(n, 7);
        assert_eq!(&a, b"ab");
        assert_eq!(&c, b"cdef");
        assert_eq!(&d[..1], b"g");
    }

    #[tokio::test(start_paused = true)]
    async fn test_extract_in_order() {
        let queue = ReceivedMessageQueue::default();
        queue.insert(message(1, &[b"x"])).await;
        queue.insert(message(2, &[b"yz"])).await;
        assert_eq!(queue.cumulative_size().await, 3);
        assert_eq!(queue.next_message_size(None).await, Waited::Ready(1));

        assert_eq!(queue.extract(None).await, Waited::Ready(message(1, &[b"x"])));
        assert_eq!(queue.extract(None).await, Waited::Ready(message(2, &[b"yz"])));
        assert_eq!(queue.cumulative_size().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout() {
        let queue = ReceivedMessageQueue::default();
        let start = Instant::now();
        assert_eq!(queue.extract(Some(Duration::from_millis(20))).await, Waited::Timeout);
        assert_eq!(Instant::now() - start, Duration::from_millis(20));
        assert_eq!(queue.next_message_size(Some(Duration::from_millis(5))).await, Waited::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wakes_on_insert() {
        let queue = Arc::new(ReceivedMessageQueue::default());
        let queue2 = queue.clone();
        let handle = tokio::spawn(async move { queue2.extract(None).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        queue.insert(message(7, &[b"late"])).await;
        assert_eq!(handle.await.unwrap(), Waited::Ready(message(7, &[b"late"])));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close() {
        let queue = Arc::new(ReceivedMessageQueue::default());
        queue.insert(message(1, &[b"x"])).await;

        let queue2 = queue.clone();
        let handle = tokio::spawn(async move {
            let first = queue2.extract(None).await;
            let second = queue2.extract(None).await;
            (first, second)
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        queue.close().await;

        let (first, second) = handle.await.unwrap();
        assert_eq!(first, Waited::Ready(message(1, &[b"x"])));
        assert_eq!(second, Waited::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_freeze_defrost() {
        let queue = ReceivedMessageQueue::default();
        queue.insert(message(1, &[b"ab", b"c"])).await;
        queue.insert(message(9, &[])).await;

        let mut freezer = Freezer::new(Instant::now());
        queue.freeze(&mut freezer).await;
        let image = freezer.finish();

        let mut defroster = Defroster::new(image, Instant::now()).unwrap();
        let defrosted = ReceivedMessageQueue::defrost(&mut defroster).unwrap();
        defroster.finish().unwrap();

        assert_eq!(defrosted.cumulative_size().await, 3);
        assert_eq!(defrosted.extract(None).await, Waited::Ready(message(1, &[b"ab", b"c"])));
        assert_eq!(defrosted.extract(None).await, Waited::Ready(message(9, &[])));
    }
}
