//! Bounded host-side message queue
//!
//! Packets carry an id and a payload of at most [`MAX_PAYLOAD`] bytes. A
//! queue holds at most [`QUEUE_CAPACITY`] packets and rejects sends once
//! full instead of overwriting.

use crate::diagnostics::RuntimeError;
use std::collections::VecDeque;

pub const QUEUE_CAPACITY: usize = 64;
pub const MAX_PAYLOAD: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub id: u32,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn new(id: u32, payload: impl Into<Vec<u8>>) -> Self {
        Self { id, payload: payload.into() }
    }

    pub fn payload_size(&self) -> usize {
        self.payload.len()
    }
}

/// FIFO channel between host components
#[derive(Debug)]
pub struct MessageQueue {
    channel: String,
    packets: VecDeque<Packet>,
    capacity: usize,
    sent: u64,
    received: u64,
}

impl MessageQueue {
    pub fn new(channel: impl Into<String>) -> Self {
        Self::with_capacity(channel, QUEUE_CAPACITY)
    }

    /// A capacity of zero is raised to one
    pub fn with_capacity(channel: impl Into<String>, capacity: usize) -> Self {
        let channel = channel.into();
        let capacity = capacity.max(1);
        tracing::debug!("Opened message queue `{}` ({} slots)", channel, capacity);
        Self {
            channel,
            packets: VecDeque::with_capacity(capacity),
            capacity,
            sent: 0,
            received: 0,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.packets.len() >= self.capacity
    }

    /// Enqueue a packet. On error the queue is unchanged.
    pub fn send(&mut self, packet: Packet) -> Result<(), RuntimeError> {
        if packet.payload.len() > MAX_PAYLOAD {
            return Err(RuntimeError::PayloadTooLarge {
                size: packet.payload.len(),
                max: MAX_PAYLOAD,
            });
        }
        if self.is_full() {
            tracing::warn!("Message queue `{}` is full, dropping packet {}", self.channel, packet.id);
            return Err(RuntimeError::QueueFull {
                channel: self.channel.clone(),
                capacity: self.capacity,
            });
        }
        tracing::trace!(
            "Queued packet {} ({} bytes) on `{}`",
            packet.id,
            packet.payload.len(),
            self.channel
        );
        self.packets.push_back(packet);
        self.sent += 1;
        Ok(())
    }

    /// Oldest pending packet, or `None` when the queue is empty
    pub fn recv(&mut self) -> Option<Packet> {
        let packet = self.packets.pop_front()?;
        self.received += 1;
        Some(packet)
    }

    pub fn peek(&self) -> Option<&Packet> {
        self.packets.front()
    }

    /// Drop every pending packet
    pub fn clear(&mut self) {
        if !self.packets.is_empty() {
            tracing::debug!("Discarding {} packet(s) on `{}`", self.packets.len(), self.channel);
        }
        self.packets.clear();
    }

    /// (sent, received) totals since the queue was opened
    pub fn totals(&self) -> (u64, u64) {
        (self.sent, self.received)
    }
}
