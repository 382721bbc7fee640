//! # Collaborator Services
//!
//! The endpoint performs no I/O of its own. Outgoing datagrams go through
//! a [`NetworkService`]; cids, tokens, hello randoms and path challenges
//! come from a [`RandomSource`]. Both are injected at construction next to
//! the [`crate::crypto::CryptoService`].
//!
//! [`MemoryNetwork`] and [`SeededRandom`] are deterministic implementations
//! for scripted runs and tests.

#![forbid(unsafe_code)]

use bytes::Bytes;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::rc::Rc;

/// A UDP payload with its peer address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub addr: SocketAddr,
    pub payload: Bytes,
}

/// Datagram sink used by the endpoint on every flush.
pub trait NetworkService {
    fn send(&mut self, destination: SocketAddr, datagram: Bytes);
}

/// Randomness used for identifiers and nonces.
pub trait RandomSource {
    fn fill(&mut self, buf: &mut [u8]);

    fn next_u64(&mut self) -> u64 {
        let mut bytes = [0u8; 8];
        self.fill(&mut bytes);
        u64::from_be_bytes(bytes)
    }
}

/// Network that records sent datagrams in a shared queue.
///
/// Clones share the queue, so a test keeps one handle while the endpoint
/// owns the other.
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    sent: Rc<RefCell<VecDeque<Datagram>>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take every datagram sent so far.
    pub fn drain(&self) -> Vec<Datagram> {
        self.sent.borrow_mut().drain(..).collect()
    }

    pub fn pop(&self) -> Option<Datagram> {
        self.sent.borrow_mut().pop_front()
    }

    pub fn len(&self) -> usize {
        self.sent.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sent.borrow().is_empty()
    }
}

impl NetworkService for MemoryNetwork {
    fn send(&mut self, destination: SocketAddr, datagram: Bytes) {
        self.sent.borrow_mut().push_back(Datagram {
            addr: destination,
            payload: datagram,
        });
    }
}

/// xorshift64* generator; the same seed always yields the same bytes.
#[derive(Debug, Clone)]
pub struct SeededRandom {
    state: u64,
}

impl SeededRandom {
    pub fn new(seed: u64) -> Self {
        // zero is a fixed point of xorshift
        let state = seed ^ 0x9e37_79b9_7f4a_7c15;
        Self {
            state: if state == 0 { 1 } else { state },
        }
    }

    fn step(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_f491_4f6c_dd1d)
    }
}

impl RandomSource for SeededRandom {
    fn fill(&mut self, buf: &mut [u8]) {
        for chunk in buf.chunks_mut(8) {
            let bytes = self.step().to_be_bytes();
            chunk.copy_from_slice(&bytes[..chunk.len()]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_network_shares_queue() {
        let handle = MemoryNetwork::new();
        let mut owned = handle.clone();
        let addr: SocketAddr = "127.0.0.1:4433".parse().unwrap();
        owned.send(addr, Bytes::from_static(b"one"));
        owned.send(addr, Bytes::from_static(b"two"));
        assert_eq!(handle.len(), 2);
        assert_eq!(handle.pop().unwrap().payload, Bytes::from_static(b"one"));
        assert_eq!(handle.drain().len(), 1);
        assert!(handle.is_empty());
    }

    #[test]
    fn test_seeded_random_is_deterministic() {
        let mut a = SeededRandom::new(7);
        let mut b = SeededRandom::new(7);
        let mut x = [0u8; 13];
        let mut y = [0u8; 13];
        a.fill(&mut x);
        b.fill(&mut y);
        assert_eq!(x, y);
        assert_ne!(SeededRandom::new(8).next_u64(), SeededRandom::new(7).next_u64());
    }

    #[test]
    fn test_zero_seed_produces_output() {
        assert_ne!(SeededRandom::new(0).next_u64(), 0);
    }
}
