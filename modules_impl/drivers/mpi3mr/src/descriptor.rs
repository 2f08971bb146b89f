//! # Reply Descriptors
//!
//! A reply descriptor is 16 bytes. The last word carries the phase bit and the
//! descriptor type; words at 8 and 10 carry the consumer index and id of the
//! request queue the completed request came from.

use crate::mpi::{ioc_status, le_u16, le_u32, le_u64, reply_flags, REPLY_DESC_SIZE};
use helix_hal::PhysAddr;
use static_assertions::const_assert_eq;

const REQ_Q_CI_OFFSET: usize = 8;
const REQ_Q_ID_OFFSET: usize = 10;
const FLAGS_OFFSET: usize = 14;

const_assert_eq!(FLAGS_OFFSET + 2, REPLY_DESC_SIZE);

/// What the controller reported for one request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyDescriptor {
    /// Terminal status with no reply frame
    Status {
        /// Host tag of the request
        host_tag: u16,
        /// IOC status, log-info flag removed
        ioc_status: u16,
        /// Log info when the controller flagged it valid
        loginfo: Option<u32>,
    },
    /// A full reply frame in the reply pool
    AddressReply {
        /// Bus address of the reply frame
        dma_address: PhysAddr,
    },
    /// Implicit success
    Success {
        /// Host tag of the request
        host_tag: u16,
    },
}

/// A descriptor plus the request-queue progress it carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedReply {
    /// The reply itself
    pub desc: ReplyDescriptor,
    /// Request queue the request was taken from
    pub req_q_id: u16,
    /// That queue's consumer index as seen by the controller
    pub req_q_ci: u16,
}

/// Decode a raw descriptor
///
/// Returns `None` for descriptor types the driver does not know.
pub fn decode(raw: &[u8; REPLY_DESC_SIZE]) -> Option<DecodedReply> {
    let flags = le_u16(raw, FLAGS_OFFSET);
    let desc = match flags & reply_flags::TYPE_MASK {
        reply_flags::TYPE_STATUS => {
            let status = le_u16(raw, 2);
            ReplyDescriptor::Status {
                host_tag: le_u16(raw, 0),
                ioc_status: status & ioc_status::STATUS_MASK,
                loginfo: (status & ioc_status::LOGINFO_AVAIL != 0).then(|| le_u32(raw, 4)),
            }
        }
        reply_flags::TYPE_ADDRESS_REPLY => ReplyDescriptor::AddressReply {
            dma_address: PhysAddr::new(le_u64(raw, 0)),
        },
        reply_flags::TYPE_SUCCESS => ReplyDescriptor::Success {
            host_tag: le_u16(raw, 0),
        },
        _ => return None,
    };
    Some(DecodedReply {
        desc,
        req_q_id: le_u16(raw, REQ_Q_ID_OFFSET),
        req_q_ci: le_u16(raw, REQ_Q_CI_OFFSET),
    })
}

/// Encode a descriptor the way the controller writes it
pub fn encode(reply: &DecodedReply, phase: bool) -> [u8; REPLY_DESC_SIZE] {
    let mut raw = [0u8; REPLY_DESC_SIZE];
    let kind = match reply.desc {
        ReplyDescriptor::Status { host_tag, ioc_status: status, loginfo } => {
            raw[0..2].copy_from_slice(&host_tag.to_le_bytes());
            let flagged = if loginfo.is_some() {
                status | ioc_status::LOGINFO_AVAIL
            } else {
                status
            };
            raw[2..4].copy_from_slice(&flagged.to_le_bytes());
            raw[4..8].copy_from_slice(&loginfo.unwrap_or(0).to_le_bytes());
            reply_flags::TYPE_STATUS
        }
        ReplyDescriptor::AddressReply { dma_address } => {
            raw[0..8].copy_from_slice(&dma_address.as_u64().to_le_bytes());
            reply_flags::TYPE_ADDRESS_REPLY
        }
        ReplyDescriptor::Success { host_tag } => {
            raw[0..2].copy_from_slice(&host_tag.to_le_bytes());
            reply_flags::TYPE_SUCCESS
        }
    };
    raw[REQ_Q_CI_OFFSET..REQ_Q_CI_OFFSET + 2].copy_from_slice(&reply.req_q_ci.to_le_bytes());
    raw[REQ_Q_ID_OFFSET..REQ_Q_ID_OFFSET + 2].copy_from_slice(&reply.req_q_id.to_le_bytes());
    let flags = kind | phase as u16;
    raw[FLAGS_OFFSET..].copy_from_slice(&flags.to_le_bytes());
    raw
}
