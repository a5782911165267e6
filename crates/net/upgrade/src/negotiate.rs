//! Protocol-list exchange.
//!
//! The initiator sends its candidates in preference order; the responder
//! answers with the first candidate it supports, or a rejection. Frames are
//! read exactly, so the stream can be handed to the selected protocol with no
//! bytes consumed beyond the answer.

use futures::{AsyncRead, AsyncWrite};
use plexus_net_codec::{read_frame, write_frame};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::NegotiationError;

/// Upper bound on a negotiation frame.
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
enum Negotiation {
    Propose(Vec<String>),
    Accept(String),
    Reject,
}

/// Proposes `protocols` and returns the one the remote accepted.
pub async fn dialer_select<S, P>(io: &mut S, protocols: &[P]) -> Result<String, NegotiationError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    P: AsRef<str>,
{
    let proposed: Vec<String> = protocols.iter().map(|p| p.as_ref().to_string()).collect();
    write_frame(io, &Negotiation::Propose(proposed.clone()), MAX_FRAME_SIZE).await?;

    match read_frame(io, MAX_FRAME_SIZE).await? {
        Negotiation::Accept(protocol) if proposed.contains(&protocol) => {
            trace!(%protocol, "protocol accepted");
            Ok(protocol)
        }
        Negotiation::Reject => Err(NegotiationError::Rejected(proposed)),
        Negotiation::Accept(_) | Negotiation::Propose(_) => Err(NegotiationError::UnexpectedMessage),
    }
}

/// Answers a proposal with the first proposed protocol in `supported`.
pub async fn listener_select<S, P>(io: &mut S, supported: &[P]) -> Result<String, NegotiationError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    P: AsRef<str>,
{
    let Negotiation::Propose(proposed) = read_frame(io, MAX_FRAME_SIZE).await? else {
        return Err(NegotiationError::UnexpectedMessage);
    };

    let selected = proposed
        .iter()
        .find(|candidate| supported.iter().any(|s| s.as_ref() == candidate.as_str()))
        .cloned();

    match selected {
        Some(protocol) => {
            write_frame(io, &Negotiation::Accept(protocol.clone()), MAX_FRAME_SIZE).await?;
            trace!(%protocol, "protocol selected");
            Ok(protocol)
        }
        None => {
            write_frame(io, &Negotiation::Reject, MAX_FRAME_SIZE).await?;
            Err(NegotiationError::NoCommonProtocol(proposed))
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use tokio_util::compat::TokioAsyncReadCompatExt;

    use super::*;

    #[tokio::test]
    async fn test_responder_follows_initiator_preference() {
        let (a, b) = tokio::io::duplex(1024);
        let (mut a, mut b) = (a.compat(), b.compat());

        let (dialer, listener) = tokio::join!(
            dialer_select(&mut a, &["/b/1", "/a/1"]),
            listener_select(&mut b, &["/a/1", "/b/1"]),
        );

        assert_eq!(dialer.unwrap(), "/b/1");
        assert_eq!(listener.unwrap(), "/b/1");
    }

    #[tokio::test]
    async fn test_reject_when_nothing_shared() {
        let (a, b) = tokio::io::duplex(1024);
        let (mut a, mut b) = (a.compat(), b.compat());

        let (dialer, listener) = tokio::join!(
            dialer_select(&mut a, &["/echo/1.0.0"]),
            listener_select(&mut b, &["/ipfs/id/1.0.0"]),
        );

        assert_matches!(dialer, Err(NegotiationError::Rejected(p)) if p == ["/echo/1.0.0"]);
        assert_matches!(listener, Err(NegotiationError::NoCommonProtocol(_)));
    }

    #[tokio::test]
    async fn test_stream_is_positioned_after_answer() {
        use futures::{AsyncReadExt, AsyncWriteExt};

        let (a, b) = tokio::io::duplex(1024);
        let (mut a, mut b) = (a.compat(), b.compat());

        let dialer = async {
            dialer_select(&mut a, &["/echo/1.0.0"]).await.unwrap();
            a.write_all(b"hey").await.unwrap();
        };
        let listener = async {
            listener_select(&mut b, &["/echo/1.0.0"]).await.unwrap();
            let mut buf = [0u8; 3];
            b.read_exact(&mut buf).await.unwrap();
            buf
        };

        let ((), buf) = tokio::join!(dialer, listener);
        assert_eq!(&buf, b"hey");
    }
}
