//! Bulk noderef transfers.
//!
//! A noderef travels as a protocol header (`AnnouncementRequest` or
//! `AnnounceReply`) followed by an opaque padded blob on the bulk channel,
//! correlated by a fresh `transfer_uid`. Sending is two-step: *start*
//! queues the header and payload, *finish* blocks until the payload has
//! drained, so the admission round-trip overlaps the upload. Payloads are
//! staged through the temp bucket pool on both directions.
//!
//! Padding: blobs are padded with random bytes to the next 1024-byte
//! boundary before transmission; the receive side reads back only the
//! advertised `noderef_length` and discards the rest.

use std::io::{self, Read, Write};

use rand::RngCore;
use tracing::{debug, warn};

use crate::bucket::{TempBucket, TempBucketPool};
use crate::counter::ByteCounter;
use crate::location::Location;
use crate::messages::{Body, Message, RejectCode, MAX_PADDED_NODEREF};
use crate::peers::PeerId;
use crate::protocols::{MessageRouter, NotConnected};

/// Noderef blobs are padded to a multiple of this.
const PADDING_BLOCK: u32 = 1024;

/// Why an outbound transfer failed.
#[derive(Debug)]
pub enum TransferError {
    /// The peer dropped; route elsewhere.
    NotConnected,
    /// Staging through the bucket pool failed.
    Io(io::Error),
}

impl std::fmt::Display for TransferError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransferError::NotConnected => write!(f, "peer not connected"),
            TransferError::Io(e) => write!(f, "transfer staging failed: {}", e),
        }
    }
}

impl std::error::Error for TransferError {}

impl From<NotConnected> for TransferError {
    fn from(_: NotConnected) -> Self {
        TransferError::NotConnected
    }
}

impl From<io::Error> for TransferError {
    fn from(e: io::Error) -> Self {
        TransferError::Io(e)
    }
}

/// Handle to an announcement transfer whose header and payload are queued
/// but not necessarily drained yet.
#[derive(Clone, Copy, Debug)]
pub struct StartedTransfer {
    pub transfer_uid: u64,
    padded_length: u32,
}

/// Padded wire size for a blob of `len` bytes.
pub fn padded_size(len: usize) -> u32 {
    let len = len as u32;
    len.div_ceil(PADDING_BLOCK).max(1) * PADDING_BLOCK
}

/// Stage a blob in a pool bucket with random padding to the block
/// boundary, returning the read-only bucket and the padded length.
fn stage_padded(pool: &TempBucketPool, payload: &[u8]) -> io::Result<(TempBucket, u32)> {
    let padded_length = padded_size(payload.len());
    let bucket = pool.make(padded_length as u64)?;
    {
        let mut writer = bucket.writer()?;
        writer.write_all(payload)?;
        let mut padding = vec![0u8; padded_length as usize - payload.len()];
        rand::thread_rng().fill_bytes(&mut padding);
        writer.write_all(&padding)?;
        writer.flush()?;
    }
    bucket.set_read_only();
    Ok((bucket, padded_length))
}

fn read_back(bucket: &TempBucket, len: usize) -> io::Result<Vec<u8>> {
    let mut out = vec![0u8; len];
    bucket.reader()?.read_exact(&mut out)?;
    Ok(out)
}

/// Send the `AnnouncementRequest` header and queue the padded noderef for
/// transmission. Returns without waiting for the payload to drain; call
/// [`finish_announcement`] for that.
pub async fn start_announcement(
    router: &dyn MessageRouter,
    pool: &TempBucketPool,
    to: &PeerId,
    uid: u64,
    noderef: &[u8],
    htl: u16,
    nearest: Location,
    target: Location,
    counter: &ByteCounter,
) -> Result<StartedTransfer, TransferError> {
    let transfer_uid = rand::random::<u64>();
    let (bucket, padded_length) = stage_padded(pool, noderef)?;
    let padded = read_back(&bucket, padded_length as usize)?;
    bucket.free();

    let header = Message::new(
        uid,
        Body::AnnouncementRequest {
            htl,
            nearest_location: nearest.as_f64(),
            target_location: target.as_f64(),
            transfer_uid,
            noderef_length: noderef.len() as u32,
            padded_length,
        },
    );
    router.send(to, header, counter).await?;
    router.queue_bulk(to, transfer_uid, padded)?;
    debug!(uid, transfer_uid, to = %to, padded_length, "announcement transfer started");
    Ok(StartedTransfer {
        transfer_uid,
        padded_length,
    })
}

/// Block until the queued announcement payload has drained to the peer.
pub async fn finish_announcement(
    router: &dyn MessageRouter,
    to: &PeerId,
    started: StartedTransfer,
    counter: &ByteCounter,
) -> Result<(), NotConnected> {
    router.flush_bulk(to, started.transfer_uid).await?;
    counter.sent_bytes(started.padded_length as usize);
    Ok(())
}

/// Send a collected noderef back as an `AnnounceReply`, draining the
/// payload before returning.
pub async fn send_announcement_reply(
    router: &dyn MessageRouter,
    pool: &TempBucketPool,
    to: &PeerId,
    uid: u64,
    noderef: &[u8],
    counter: &ByteCounter,
) -> Result<(), TransferError> {
    let transfer_uid = rand::random::<u64>();
    let (bucket, padded_length) = stage_padded(pool, noderef)?;
    let padded = read_back(&bucket, padded_length as usize)?;
    bucket.free();

    let header = Message::new(
        uid,
        Body::AnnounceReply {
            transfer_uid,
            noderef_length: noderef.len() as u32,
            padded_length,
        },
    );
    router.send(to, header, counter).await?;
    router.queue_bulk(to, transfer_uid, padded)?;
    router.flush_bulk(to, transfer_uid).await?;
    counter.sent_bytes(padded_length as usize);
    Ok(())
}

/// Receive the noderef a peer announced under `transfer_uid`. Returns the
/// unpadded bytes, or None on transport failure or a nonsensical header.
pub async fn wait_for_noderef(
    router: &dyn MessageRouter,
    pool: &TempBucketPool,
    from: &PeerId,
    transfer_uid: u64,
    noderef_length: u32,
    padded_length: u32,
    counter: &ByteCounter,
) -> Option<Vec<u8>> {
    if noderef_length == 0 || noderef_length > padded_length || padded_length > MAX_PADDED_NODEREF {
        warn!(
            from = %from,
            transfer_uid,
            noderef_length,
            padded_length,
            "refusing noderef transfer with bogus lengths"
        );
        return None;
    }
    let padded = router.recv_bulk(from, transfer_uid, padded_length).await?;
    if padded.len() != padded_length as usize {
        warn!(from = %from, transfer_uid, got = padded.len(), padded_length, "truncated noderef transfer");
        return None;
    }
    counter.received_bytes(padded.len());

    // Stage through the pool, then strip the padding on read-back.
    let staged = (|| -> io::Result<Vec<u8>> {
        let bucket = pool.make(padded_length as u64)?;
        {
            let mut writer = bucket.writer()?;
            writer.write_all(&padded)?;
            writer.flush()?;
        }
        bucket.set_read_only();
        let out = read_back(&bucket, noderef_length as usize)?;
        bucket.free();
        Ok(out)
    })();
    match staged {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            warn!(from = %from, transfer_uid, error = %e, "failed to stage received noderef");
            None
        }
    }
}

/// Tell a peer their noderef was refused.
pub async fn reject_noderef(
    router: &dyn MessageRouter,
    to: &PeerId,
    uid: u64,
    code: RejectCode,
    counter: &ByteCounter,
) -> Result<(), NotConnected> {
    router
        .send(to, Message::new(uid, Body::NoderefRejected { code }), counter)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::PoolConfig;

    #[test]
    fn padded_size_rounds_up() {
        assert_eq!(padded_size(0), 1024);
        assert_eq!(padded_size(1), 1024);
        assert_eq!(padded_size(1024), 1024);
        assert_eq!(padded_size(1025), 2048);
        assert_eq!(padded_size(3000), 3072);
    }

    #[test]
    fn staging_pads_and_preserves_prefix() {
        let pool = TempBucketPool::new(PoolConfig::default());
        let payload: Vec<u8> = (0u8..200).collect();
        let (bucket, padded_length) = stage_padded(&pool, &payload).unwrap();
        assert_eq!(padded_length, 1024);
        assert_eq!(bucket.size(), 1024);
        assert!(bucket.is_read_only());

        let all = read_back(&bucket, 1024).unwrap();
        assert_eq!(&all[..200], &payload[..]);
        bucket.free();
    }
}
