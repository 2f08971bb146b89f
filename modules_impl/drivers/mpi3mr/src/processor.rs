//! # Reply Processing
//!
//! Interrupt-context completion: drain the reply rings serviced by a vector,
//! resolve each descriptor to its command slot, copy reply and sense data out
//! of the pools, hand the buffers back to the controller and complete the
//! command. Nothing here blocks; only spin locks and atomics are taken.

use crate::controller::Controller;
use crate::descriptor::{DecodedReply, ReplyDescriptor};
use crate::mpi::{function, ioc_status, ReplyHeader, ScsiIoReply, HOST_TAG_INVALID};
use crate::queue::{QueuePair, ReplyQueue, RequestQueue};
use alloc::vec::Vec;
use helix_hal::interrupts::InterruptVector;
use helix_hal::PhysAddr;

impl Controller {
    /// Drain every reply queue serviced by `vector`
    ///
    /// Vector 0 also services the admin reply queue. Returns the number of
    /// descriptors consumed.
    pub fn poll_reply_queue(&self, vector: InterruptVector) -> usize {
        let mut handled = 0;
        if vector == 0 {
            handled += self.process_admin_reply_queue();
        }
        let queues = self.op_queues.read();
        for pair in queues.iter().filter(|q| q.reply.vector() == vector) {
            handled += self.process_op_reply_queue(pair);
        }
        handled
    }

    /// Interrupt entry point
    ///
    /// Returns `true` if the interrupt was ours.
    pub fn handle_interrupt(&self, vector: InterruptVector) -> bool {
        if self.is_unrecoverable() {
            return false;
        }
        self.poll_reply_queue(vector) > 0
    }

    fn process_admin_reply_queue(&self) -> usize {
        self.drain_pair(&self.admin.request, &self.admin.reply)
    }

    pub(crate) fn process_op_reply_queue(&self, pair: &QueuePair) -> usize {
        self.drain_pair(&pair.request, &pair.reply)
    }

    fn drain_pair(&self, request: &RequestQueue, reply: &ReplyQueue) -> usize {
        let mut consumed = 0;
        for decoded in reply.drain(&*self.regs) {
            consumed += 1;
            if let Some(d) = decoded {
                self.process_reply(d, request, reply);
            }
        }
        consumed
    }

    fn process_reply(&self, reply: DecodedReply, request: &RequestQueue, reply_q: &ReplyQueue) {
        if reply.req_q_id == request.qid() {
            request.update_ci(reply.req_q_ci);
        } else {
            log::warn!(
                "[mpi3mr] reply on queue {} names request queue {}",
                reply_q.qid(),
                reply.req_q_id
            );
        }

        match reply.desc {
            ReplyDescriptor::Success { host_tag } => {
                self.complete_command(reply_q, host_tag, ioc_status::SUCCESS, 0, None, None)
            }
            ReplyDescriptor::Status { host_tag, ioc_status, loginfo } => {
                if let Some(info) = loginfo {
                    log::debug!("[mpi3mr] tag {:#06x} status {:#06x} loginfo {:#010x}", host_tag, ioc_status, info);
                }
                self.complete_command(reply_q, host_tag, ioc_status, loginfo.unwrap_or(0), None, None)
            }
            ReplyDescriptor::AddressReply { dma_address } => self.process_address_reply(reply_q, dma_address),
        }
    }

    /// Copy an address reply out of the pools and repost what it used
    fn process_address_reply(&self, reply_q: &ReplyQueue, addr: PhysAddr) {
        let (frame, sense) = {
            let pools = self.pools.read();
            let Some(pools) = pools.as_ref() else {
                log::warn!("[mpi3mr] address reply {} before pools exist", addr);
                return;
            };
            let Some(frame) = pools.reply.take(addr, pools.reply.buf_size()) else {
                log::warn!("[mpi3mr] address reply {} outside the reply pool", addr);
                return;
            };

            let mut sense = None;
            let io_reply = ReplyHeader::parse(&frame)
                .filter(|h| h.function == function::SCSI_IO)
                .and_then(|_| ScsiIoReply::parse(&frame));
            if let Some(io) = io_reply.filter(|io| io.sense_buffer != PhysAddr::NULL) {
                let data = pools.sense.take(io.sense_buffer, pools.sense.buf_size());
                if io.sense_valid() {
                    sense = data.map(|mut d: Vec<u8>| {
                        d.truncate(io.sense_count as usize);
                        d
                    });
                }
                if let Err(e) = pools.sense.repost(&*self.regs, io.sense_buffer) {
                    log::warn!("[mpi3mr] sense buffer {} not reposted: {}", io.sense_buffer, e);
                }
            }
            if let Err(e) = pools.reply.repost(&*self.regs, addr) {
                log::warn!("[mpi3mr] reply frame {} not reposted: {}", addr, e);
            }
            (frame, sense)
        };

        let Some(header) = ReplyHeader::parse(&frame) else {
            log::warn!("[mpi3mr] short reply frame at {}", addr);
            return;
        };
        if header.host_tag == HOST_TAG_INVALID {
            if header.function == function::EVENT_NOTIFICATION {
                self.handle_event_frame(&frame);
            } else {
                log::warn!("[mpi3mr] unsolicited reply for function {:#04x} dropped", header.function);
            }
            return;
        }
        self.complete_command(
            reply_q,
            header.host_tag,
            header.status(),
            header.loginfo().unwrap_or(0),
            Some(frame),
            sense,
        );
    }

    fn complete_command(
        &self,
        reply_q: &ReplyQueue,
        host_tag: u16,
        status: u16,
        loginfo: u32,
        reply: Option<Vec<u8>>,
        sense: Option<Vec<u8>>,
    ) {
        if host_tag == HOST_TAG_INVALID {
            log::warn!("[mpi3mr] descriptor with the invalid host tag dropped");
            return;
        }
        if let Some(binding) = self.tracker.take_io_binding(host_tag) {
            self.io_finished(&binding);
            reply_q.io_completed();
        }
        self.tracker.complete(self, host_tag, status, loginfo, reply, sense);
    }
}
