//! Per-PeerLink candidate buffer
//!
//! Remote candidates are meaningless until a remote description is applied.
//! Until then they queue here; [`CandidateBuffer::flush`] applies them in
//! arrival order right after the description lands. Nothing is dropped
//! except by [`CandidateBuffer::discard`] at teardown.

use crate::media::PeerConnectionHandle;
use crate::signaling::IceCandidate;
use crate::Result;
use std::collections::VecDeque;
use tracing::{debug, warn};

/// Outcome of one flush
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Candidates the engine accepted
    pub applied: usize,
    /// Candidates the engine rejected (logged)
    pub rejected: usize,
}

/// FIFO of candidates waiting for a remote description
#[derive(Debug, Default)]
pub struct CandidateBuffer {
    pending: VecDeque<IceCandidate>,
    remote_applied: bool,
}

impl CandidateBuffer {
    /// Empty buffer, no remote description applied
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer `candidate`, or apply it at once if a remote description is in place
    ///
    /// # Errors
    ///
    /// The engine's error when applying immediately.
    pub async fn enqueue(
        &mut self,
        connection: &dyn PeerConnectionHandle,
        candidate: IceCandidate,
    ) -> Result<()> {
        if !self.remote_applied {
            self.pending.push_back(candidate);
            debug!("Buffered remote candidate ({} pending)", self.pending.len());
            return Ok(());
        }
        connection.add_ice_candidate(candidate).await
    }

    /// Mark the remote description applied and apply everything buffered, oldest first
    pub async fn flush(&mut self, connection: &dyn PeerConnectionHandle) -> FlushReport {
        self.remote_applied = true;
        let mut report = FlushReport::default();
        while let Some(candidate) = self.pending.pop_front() {
            match connection.add_ice_candidate(candidate).await {
                Ok(()) => report.applied += 1,
                Err(e) => {
                    warn!("Buffered candidate rejected: {}", e);
                    report.rejected += 1;
                }
            }
        }
        report
    }

    /// Start a new negotiation round; candidates buffer until the next flush
    pub fn begin_round(&mut self) {
        self.remote_applied = false;
    }

    /// Drop everything (teardown only); returns how many were dropped
    pub fn discard(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        self.remote_applied = false;
        dropped
    }

    /// Buffered candidates
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// True if nothing is buffered
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Whether candidates currently go straight to the engine
    pub fn remote_applied(&self) -> bool {
        self.remote_applied
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{MediaEngine, SimEngine};
    use std::sync::Arc;

    async fn connection_with_remote() -> (SimEngine, Arc<dyn PeerConnectionHandle>) {
        let engine = SimEngine::new();
        let conn = engine.create_connection("a1", &[]).await.unwrap();
        let other = SimEngine::new().create_connection("b1", &[]).await.unwrap();
        let offer = other.create_offer(false).await.unwrap();
        conn.set_remote_description(offer).await.unwrap();
        (engine, conn)
    }

    #[tokio::test]
    async fn test_flush_applies_in_arrival_order() {
        let (engine, conn) = connection_with_remote().await;
        let mut buffer = CandidateBuffer::new();
        for n in 0..5 {
            buffer
                .enqueue(conn.as_ref(), IceCandidate::new(format!("candidate:{}", n)))
                .await
                .unwrap();
        }
        assert_eq!(buffer.len(), 5);
        assert!(engine.connection("a1").unwrap().applied_candidates().is_empty());

        let report = buffer.flush(conn.as_ref()).await;
        assert_eq!(report, FlushReport { applied: 5, rejected: 0 });
        assert!(buffer.is_empty());

        let applied: Vec<_> = engine
            .connection("a1")
            .unwrap()
            .applied_candidates()
            .into_iter()
            .map(|c| c.candidate)
            .collect();
        assert_eq!(
            applied,
            (0..5).map(|n| format!("candidate:{}", n)).collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn test_enqueue_after_flush_applies_immediately() {
        let (engine, conn) = connection_with_remote().await;
        let mut buffer = CandidateBuffer::new();
        buffer.flush(conn.as_ref()).await;
        buffer
            .enqueue(conn.as_ref(), IceCandidate::new("candidate:late"))
            .await
            .unwrap();
        assert!(buffer.is_empty());
        assert_eq!(engine.connection("a1").unwrap().applied_candidates().len(), 1);
    }

    #[tokio::test]
    async fn test_begin_round_buffers_again() {
        let (_engine, conn) = connection_with_remote().await;
        let mut buffer = CandidateBuffer::new();
        buffer.flush(conn.as_ref()).await;
        buffer.begin_round();
        buffer
            .enqueue(conn.as_ref(), IceCandidate::new("candidate:restart"))
            .await
            .unwrap();
        assert_eq!(buffer.len(), 1);
    }

    #[tokio::test]
    async fn test_rejected_candidates_are_counted() {
        let engine = SimEngine::new();
        let conn = engine.create_connection("a1", &[]).await.unwrap();
        let mut buffer = CandidateBuffer::new();
        buffer
            .enqueue(conn.as_ref(), IceCandidate::new("candidate:0"))
            .await
            .unwrap();
        // No remote description on the engine side, so application fails
        let report = buffer.flush(conn.as_ref()).await;
        assert_eq!(report, FlushReport { applied: 0, rejected: 1 });
    }

    #[test]
    fn test_discard() {
        let mut buffer = CandidateBuffer::new();
        buffer.pending.push_back(IceCandidate::new("candidate:0"));
        buffer.pending.push_back(IceCandidate::new("candidate:1"));
        assert_eq!(buffer.discard(), 2);
        assert!(buffer.is_empty());
    }
}
