//! # Bring-up and Shutdown
//!
//! Bring-up takes the controller from whatever state the firmware left it in
//! to `Ready` with operational queues:
//!
//! 1. settle a transitional state, then reach `Reset` (MUR or soft reset)
//! 2. program the admin queues and enable the IOC
//! 3. IOC facts, derive limits, allocate the pools once
//! 4. IOC init, post the free queues, unmask vectors
//! 5. create the operational queue pairs
//!
//! The same sequence runs after a soft reset, with two differences: limits
//! may not shrink and the queue count must come back unchanged.

use crate::controller::{Controller, IocLimits, Pools};
use crate::error::{ControllerError, ControllerResult};
use crate::mpi::{self, IocFacts, IocInitParams, IOC_FACTS_DATA_SIZE, REPLY_DESC_SIZE};
use crate::pool::{BufferPool, PoolKind};
use crate::queue::QueuePair;
use crate::regs::{self, IocConfig, IocStatus, ResetAction};
use crate::retry::Retry;
use crate::state::{ControllerState, ResetReason};
use crate::tracker::TagRange;
use alloc::vec::Vec;
use core::sync::atomic::Ordering;

/// Why the controller is being initialized
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitType {
    /// First bring-up
    Init,
    /// Re-initialization after a soft reset
    Reset,
}

/// Transfers above this many blocks count as large when the IOC gives no limit
const DEFAULT_THROTTLE_DATA_BLOCKS: u32 = 2048 + 2;
/// Shutdown timeout when the facts leave it unset
const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 60_000;
/// Interval between shutdown status polls
const SHUTDOWN_POLL_MS: u64 = 100;
/// Soft resets attempted while the controller faults during shutdown
const MAX_SHUTDOWN_RETRIES: u32 = 2;

impl Controller {
    /// Bring the controller up and register for events
    pub fn initialize(&self) -> ControllerResult<()> {
        self.check_alive()?;
        log::info!("[mpi3mr] controller bring-up");
        self.initialize_ioc(InitType::Init)
            .and_then(|_| self.register_events())
            .map_err(|e| {
                log::error!("[mpi3mr] bring-up failed: {}", e);
                e
            })
    }

    pub(crate) fn initialize_ioc(&self, init: InitType) -> ControllerResult<()> {
        let info = self.regs.read32(regs::IOC_INFO_LOW);
        let ready_timeout_ms =
            ((info & regs::IOC_INFO_LOW_TIMEOUT_MASK) >> regs::IOC_INFO_LOW_TIMEOUT_SHIFT) as u64 * 2000;

        let mut state = self.current_state();
        log::info!("[mpi3mr] controller is {}, ready timeout {} ms", state, ready_timeout_ms);
        if state.is_transitional() {
            self.clock.delay_ms(ready_timeout_ms);
            state = self.current_state();
            log::info!("[mpi3mr] controller is {} after waiting", state);
        }
        if state == ControllerState::Ready {
            if let Err(e) = self.message_unit_reset(ResetReason::Bringup) {
                log::warn!("[mpi3mr] message unit reset at bring-up failed: {}", e);
            }
            state = self.current_state();
        }
        if state != ControllerState::Reset {
            self.log_fault_info();
            self.issue_reset(ResetAction::SoftReset, ResetReason::Bringup)?;
            state = self.current_state();
        }
        if state != ControllerState::Reset {
            log::error!("[mpi3mr] controller stuck in {} at bring-up", state);
            return Err(ControllerError::NotReady);
        }

        self.setup_admin_queues();
        self.bring_ready(ready_timeout_ms)?;
        let facts = self.issue_ioc_facts()?;
        self.process_facts(&facts, init, ready_timeout_ms)?;
        self.allocate_pools()?;
        self.issue_ioc_init()?;
        self.post_free_queues();
        self.enable_interrupts()?;
        self.create_op_queues(init)?;
        if init == InitType::Reset {
            self.register_events()?;
            self.port_enable()?;
            self.reissue_event_log_watch();
        }
        self.ready.store(true, Ordering::Release);
        log::info!("[mpi3mr] controller ready with {} operational queues", self.num_op_queues());
        Ok(())
    }

    fn setup_admin_queues(&self) {
        self.admin.reset();
        let entries = ((self.admin.reply.depth() as u32) << 16) | self.admin.request.depth() as u32;
        self.regs.write32(regs::ADMIN_Q_NUM_ENTRIES, entries);
        self.regs.write64(regs::ADMIN_REQ_Q_ADDR, self.admin.request.phys().as_u64());
        self.regs.write64(regs::ADMIN_REPLY_Q_ADDR, self.admin.reply.phys().as_u64());
        self.regs.write32(regs::ADMIN_REQ_Q_PI, 0);
        self.regs.write32(regs::ADMIN_REPLY_Q_CI, 0);
    }

    /// Enable the IOC and wait for READY
    fn bring_ready(&self, timeout_ms: u64) -> ControllerResult<()> {
        let config = (self.ioc_config() | IocConfig::ENABLE_IOC)
            .with_entry_sizes(mpi::OP_REQ_ENTRY_SIZE_LOG2, mpi::OP_REPLY_ENTRY_SIZE_LOG2);
        self.regs.write32(regs::IOC_CONFIG, config.bits());

        Retry::new(timeout_ms, self.config.poll_interval_ms)
            .try_until(&*self.clock, || match self.current_state() {
                ControllerState::Ready => Ok(Some(())),
                ControllerState::Fault => {
                    self.log_fault_info();
                    Err(ControllerError::NotReady)
                }
                _ => Ok(None),
            })
            .map_err(|e| {
                log::error!("[mpi3mr] controller did not become ready: {}", e);
                e
            })
    }

    fn issue_ioc_facts(&self) -> ControllerResult<IocFacts> {
        let data = self.dma.allocate(IOC_FACTS_DATA_SIZE, 8)?;
        let phys = data.phys();
        self.issue_internal(
            TagRange::Init,
            self.config.admin_cmd_timeout_ms,
            ResetReason::IocFactsTimeout,
            |tag| mpi::ioc_facts(tag, phys),
        )?
        .check()?;

        let mut raw = [0u8; IOC_FACTS_DATA_SIZE];
        data.read_bytes(0, &mut raw);
        IocFacts::parse(&raw).ok_or(ControllerError::InvalidFacts)
    }

    fn process_facts(&self, facts: &IocFacts, init: InitType, ready_timeout_ms: u64) -> ControllerResult<()> {
        let config = self.ioc_config();
        let req_size = config.oper_req_entry_size();
        let reply_size = config.oper_reply_entry_size();
        if facts.req_frame_size as usize != req_size || req_size != mpi::ADMIN_REQ_FRAME_SIZE {
            log::error!(
                "[mpi3mr] request frame size {} does not match entry size {}",
                facts.req_frame_size,
                req_size
            );
            return Err(ControllerError::InvalidFacts);
        }
        if reply_size != REPLY_DESC_SIZE || (facts.reply_frame_size as usize) < mpi::ScsiIoReply::LEN {
            log::error!("[mpi3mr] unsupported reply sizes {} / {}", reply_size, facts.reply_frame_size);
            return Err(ControllerError::InvalidFacts);
        }
        let reserved = self.config.internal_tag_count() + 1;
        if facts.max_reqs <= reserved {
            log::error!("[mpi3mr] {} requests leave no room for I/O", facts.max_reqs);
            return Err(ControllerError::InvalidFacts);
        }
        let max_host_ios = facts.max_reqs - reserved;

        let previous = self.limits();
        if init == InitType::Reset {
            if facts.reply_frame_size as usize > previous.reply_frame_size {
                log::error!(
                    "[mpi3mr] reply frame size cannot grow from {} to {}",
                    previous.reply_frame_size,
                    facts.reply_frame_size
                );
                return Err(ControllerError::InvalidFacts);
            }
            let queues = self.num_op_queues();
            if facts.max_op_reply_queues < queues || facts.max_op_req_queues < queues {
                log::error!("[mpi3mr] operational queue limits dropped below {}", queues);
                return Err(ControllerError::QueueCountMismatch);
            }
        }
        self.tracker.configure_io(max_host_ios)?;

        let io_throttle_data_length = match facts.io_throttle_data_length {
            0 => DEFAULT_THROTTLE_DATA_BLOCKS,
            units => units as u32 * 8,
        };
        let limits = IocLimits {
            max_host_ios,
            reply_frame_size: facts.reply_frame_size as usize,
            op_req_entry_size: req_size,
            op_reply_entry_size: reply_size,
            reply_pool_size: facts.max_reqs + self.config.event_reply_frames,
            sense_pool_size: facts.max_reqs / self.config.sense_buf_factor,
            io_throttle_data_length,
            io_throttle_high: facts.io_throttle_high as u64 * 2048,
            io_throttle_low: facts.io_throttle_low as u64 * 2048,
            ready_timeout_ms,
            shutdown_timeout_ms: match facts.shutdown_timeout {
                0 => DEFAULT_SHUTDOWN_TIMEOUT_MS,
                secs => secs as u64 * 1000,
            },
        };
        log::info!(
            "[mpi3mr] firmware {}.{}.{}.{} max_reqs {} max_host_ios {} msix {} op queues {}/{}",
            facts.fw_version[0],
            facts.fw_version[1],
            facts.fw_version[2],
            facts.fw_version[3],
            facts.max_reqs,
            max_host_ios,
            facts.max_msix_vectors,
            facts.max_op_req_queues,
            facts.max_op_reply_queues
        );
        log::debug!("[mpi3mr] {:?} personality, limits {:?}", facts.personality(), limits);

        *self.limits.write() = limits;
        *self.facts.write() = Some(facts.clone());
        Ok(())
    }

    fn allocate_pools(&self) -> ControllerResult<()> {
        let mut pools = self.pools.write();
        if pools.is_some() {
            return Ok(());
        }
        let limits = self.limits();
        let reply = BufferPool::new(
            &*self.dma,
            PoolKind::Reply,
            limits.reply_pool_size,
            limits.reply_frame_size,
            regs::REPLY_FREE_HOST_INDEX,
        )?;
        let sense = BufferPool::new(
            &*self.dma,
            PoolKind::Sense,
            limits.sense_pool_size,
            self.config.sense_buf_size as usize,
            regs::SENSE_BUF_FREE_HOST_INDEX,
        )?;
        *pools = Some(Pools { reply, sense });
        Ok(())
    }

    fn issue_ioc_init(&self) -> ControllerResult<()> {
        let params = {
            let pools = self.pools.read();
            let p = pools.as_ref().ok_or(ControllerError::NotReady)?;
            IocInitParams {
                timestamp_ms: self.clock.now_ms(),
                reply_free_depth: p.reply.free_queue_depth(),
                reply_free_addr: p.reply.free_queue_phys(),
                sense_free_depth: p.sense.free_queue_depth(),
                sense_buf_len: self.config.sense_buf_size,
                sense_free_addr: p.sense.free_queue_phys(),
            }
        };
        self.issue_internal(
            TagRange::Init,
            self.config.admin_cmd_timeout_ms,
            ResetReason::IocInitTimeout,
            |tag| mpi::ioc_init(tag, &params),
        )?
        .check()
        .map_err(|e| {
            log::error!("[mpi3mr] IOC init failed: {}", e);
            e
        })
    }

    fn post_free_queues(&self) {
        if let Some(p) = self.pools.read().as_ref() {
            p.reply.post_host_index(&*self.regs);
            p.sense.post_host_index(&*self.regs);
        }
    }

    /// Vectors the queues are spread over
    fn usable_vectors(&self) -> u16 {
        let supported = self.facts.read().as_ref().map_or(1, |f| f.max_msix_vectors.max(1));
        self.irq.vector_count().min(supported).max(1)
    }

    fn enable_interrupts(&self) -> ControllerResult<()> {
        let vectors = self.usable_vectors();
        self.irq.enable_vectors(vectors)?;
        log::debug!("[mpi3mr] {} vectors enabled", vectors);
        Ok(())
    }

    fn create_op_queues(&self, init: InitType) -> ControllerResult<()> {
        let facts = self.facts().ok_or(ControllerError::NotReady)?;
        let vectors = self.usable_vectors();

        // Completions for the create commands arrive while the list is out
        // of the lock, so the reply path never waits on it.
        let mut pairs = core::mem::take(&mut *self.op_queues.write());
        let expected = pairs.len();
        if pairs.is_empty() {
            let wanted = facts
                .max_op_reply_queues
                .min(facts.max_op_req_queues)
                .min(vectors)
                .min(self.config.max_op_queues);
            let entry_size = self.limits().op_req_entry_size;
            pairs = (0..wanted)
                .map(|i| {
                    QueuePair::operational(
                        &*self.dma,
                        i + 1,
                        i % vectors,
                        self.config.op_req_entries,
                        self.config.op_reply_entries,
                        entry_size,
                    )
                })
                .collect::<ControllerResult<Vec<_>>>()?;
        }

        let mut created = 0;
        for pair in pairs.iter() {
            if let Err(e) = self.create_reply_queue(pair) {
                log::error!("[mpi3mr] reply queue {} not created: {}", pair.reply.qid(), e);
                break;
            }
            if let Err(e) = self.create_request_queue(pair) {
                log::error!("[mpi3mr] request queue {} not created: {}", pair.request.qid(), e);
                if let Err(e) = self.delete_reply_queue(pair) {
                    log::warn!("[mpi3mr] reply queue {} not deleted: {}", pair.reply.qid(), e);
                }
                break;
            }
            created += 1;
        }

        if created == 0 {
            log::error!("[mpi3mr] no operational queue could be created");
            return Err(ControllerError::NotReady);
        }
        if init == InitType::Reset && created != expected {
            log::error!("[mpi3mr] {} operational queues after reset, expected {}", created, expected);
            return Err(ControllerError::QueueCountMismatch);
        }
        pairs.truncate(created);
        *self.op_queues.write() = pairs;
        Ok(())
    }

    fn create_reply_queue(&self, pair: &QueuePair) -> ControllerResult<()> {
        let reply = &pair.reply;
        self.issue_internal(
            TagRange::Init,
            self.config.admin_cmd_timeout_ms,
            ResetReason::CreateReplyQueueTimeout,
            |tag| mpi::create_reply_queue(tag, reply.qid(), reply.depth(), reply.vector(), reply.phys()),
        )?
        .check()
    }

    fn create_request_queue(&self, pair: &QueuePair) -> ControllerResult<()> {
        let request = &pair.request;
        self.issue_internal(
            TagRange::Init,
            self.config.admin_cmd_timeout_ms,
            ResetReason::CreateRequestQueueTimeout,
            |tag| {
                mpi::create_request_queue(tag, request.qid(), request.depth(), request.reply_qid(), request.phys())
            },
        )?
        .check()
    }

    fn delete_reply_queue(&self, pair: &QueuePair) -> ControllerResult<()> {
        let qid = pair.reply.qid();
        self.issue_internal(
            TagRange::Init,
            self.config.admin_cmd_timeout_ms,
            ResetReason::DeleteReplyQueueTimeout,
            |tag| mpi::delete_reply_queue(tag, qid),
        )?
        .check()
    }

    /// Let the controller start discovery and report devices
    pub fn port_enable(&self) -> ControllerResult<()> {
        self.check_alive()?;
        self.issue_internal(
            TagRange::Init,
            self.config.port_enable_timeout_ms,
            ResetReason::PortEnableTimeout,
            mpi::port_enable,
        )?
        .check()
        .map_err(|e| {
            log::error!("[mpi3mr] port enable failed: {}", e);
            e
        })
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Stop supervision, quiesce the IOC and request a normal shutdown
    pub fn shutdown(&self) -> ControllerResult<()> {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        log::info!("[mpi3mr] shutting down");
        self.irq.disable_all();
        self.check_alive()?;

        if self.current_state() == ControllerState::Ready && !self.is_reset_in_progress() {
            if self.message_unit_reset(ResetReason::CtlrCleanup).is_err() {
                let _ = self.issue_reset(ResetAction::SoftReset, ResetReason::MurFailure);
            }
        }
        let result = self.issue_ioc_shutdown();
        self.ready.store(false, Ordering::Release);
        result
    }

    fn shutdown_status(&self) -> u32 {
        self.regs.read32(regs::IOC_STATUS) & regs::IOC_STATUS_SHUTDOWN_MASK
    }

    fn request_ioc_shutdown(&self) {
        let config = self.regs.read32(regs::IOC_CONFIG) & !regs::IOC_CONFIG_SHUTDOWN_MASK;
        self.regs.write32(regs::IOC_CONFIG, config | IocConfig::SHUTDOWN_NORMAL.bits());
    }

    fn issue_ioc_shutdown(&self) -> ControllerResult<()> {
        self.check_alive()?;
        if self.shutdown_status() == IocStatus::SHUTDOWN_IN_PROGRESS.bits() {
            log::warn!("[mpi3mr] shutdown already in progress");
            return Ok(());
        }
        self.request_ioc_shutdown();

        let timeout_ms = match self.limits().shutdown_timeout_ms {
            0 => DEFAULT_SHUTDOWN_TIMEOUT_MS,
            ms => ms,
        };
        let mut retries = 0;
        let done = Retry::new(timeout_ms, SHUTDOWN_POLL_MS).try_until(&*self.clock, || {
            if self.shutdown_status() == IocStatus::SHUTDOWN_COMPLETE.bits() {
                return Ok(Some(()));
            }
            self.check_alive()?;
            if self.ioc_status().contains(IocStatus::FAULT) {
                self.log_fault_info();
                if retries >= MAX_SHUTDOWN_RETRIES {
                    return Err(ControllerError::Timeout);
                }
                retries += 1;
                self.issue_reset(ResetAction::SoftReset, ResetReason::CtlrCleanup)?;
                self.request_ioc_shutdown();
            }
            Ok(None)
        });

        match done {
            Ok(()) => log::info!("[mpi3mr] shutdown complete"),
            Err(e) => log::error!(
                "[mpi3mr] shutdown did not complete: {} (ioc_status {:#010x})",
                e,
                self.ioc_status().bits()
            ),
        }
        done
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DriverConfig;
    use crate::regs::fault;
    use crate::sim;

    #[test]
    fn test_bringup_programs_admin_queues() {
        let (sim, ctrl) = sim::ready_controller(DriverConfig::for_testing());
        let config = ctrl.config();
        assert_eq!(
            sim.register(regs::ADMIN_Q_NUM_ENTRIES),
            ((config.admin_reply_entries as u32) << 16) | config.admin_req_entries as u32
        );
        assert_eq!(ctrl.ioc_config().oper_req_entry_size(), 128);
        assert_eq!(ctrl.ioc_config().oper_reply_entry_size(), REPLY_DESC_SIZE);
        assert!(ctrl.irq.is_vector_enabled(0) && ctrl.irq.is_vector_enabled(1));
    }

    #[test]
    fn test_free_queues_posted_at_bringup() {
        let (sim, ctrl) = sim::ready_controller(DriverConfig::for_testing());
        let limits = ctrl.limits();
        assert_eq!(sim.register(regs::REPLY_FREE_HOST_INDEX), limits.reply_pool_size as u32);
        assert_eq!(sim.register(regs::SENSE_BUF_FREE_HOST_INDEX), limits.sense_pool_size as u32);
    }

    #[test]
    fn test_queues_spread_over_vectors() {
        let (_sim, ctrl) = sim::ready_controller(DriverConfig::for_testing());
        let queues = ctrl.op_queues.read();
        let ids: Vec<_> = queues.iter().map(|q| (q.request.qid(), q.reply.qid(), q.reply.vector())).collect();
        assert_eq!(ids, [(1, 1, 0), (2, 2, 1)]);
    }

    #[test]
    fn test_queue_count_limited_by_facts() {
        let config = DriverConfig { max_op_queues: 16, ..DriverConfig::for_testing() };
        let (sim, ctrl) = sim::controller(config);
        sim.set_max_op_queues(3);
        ctrl.initialize().unwrap();
        assert_eq!(ctrl.num_op_queues(), 3);
    }

    #[test]
    fn test_partial_queue_creation_kept_at_init() {
        let config = DriverConfig { max_op_queues: 4, ..DriverConfig::for_testing() };
        let (sim, ctrl) = sim::controller(config);
        sim.fail_request_queue(3);
        ctrl.initialize().unwrap();
        assert_eq!(ctrl.num_op_queues(), 2);
        assert_eq!(sim.op_queue_count(), 2);
    }

    #[test]
    fn test_ready_controller_gets_mur_first() {
        let (sim, ctrl) = sim::controller(DriverConfig::for_testing());
        sim.start_ready();
        ctrl.initialize().unwrap();
        assert_eq!(sim.soft_resets(), 0);
        assert_eq!(ctrl.current_state(), ControllerState::Ready);
    }

    #[test]
    fn test_faulted_controller_soft_reset_at_bringup() {
        let (sim, ctrl) = sim::controller(DriverConfig::for_testing());
        sim.inject_fault(fault::SOFT_RESET_NEEDED);
        ctrl.initialize().unwrap();
        assert_eq!(sim.soft_resets(), 1);
        assert!(ctrl.is_ready());
    }

    #[test]
    fn test_undersized_facts_rejected() {
        let (sim, ctrl) = sim::controller(DriverConfig::for_testing());
        sim.set_max_reqs(ctrl.config().internal_tag_count());
        assert_eq!(ctrl.initialize(), Err(ControllerError::InvalidFacts));
        assert!(!ctrl.is_ready());
    }

    #[test]
    fn test_throttle_limits_from_facts() {
        let (sim, ctrl) = sim::controller(DriverConfig::for_testing());
        sim.set_throttle(16, 8, 4);
        ctrl.initialize().unwrap();
        let limits = ctrl.limits();
        assert_eq!(limits.io_throttle_data_length, 128);
        assert_eq!(limits.io_throttle_high, 8 * 2048);
        assert_eq!(limits.io_throttle_low, 4 * 2048);

        let (_sim, ctrl) = sim::ready_controller(DriverConfig::for_testing());
        assert_eq!(ctrl.limits().io_throttle_data_length, DEFAULT_THROTTLE_DATA_BLOCKS);
        assert_eq!(ctrl.limits().shutdown_timeout_ms, DEFAULT_SHUTDOWN_TIMEOUT_MS);
    }

    #[test]
    fn test_port_enable_reaches_controller() {
        let (sim, ctrl) = sim::ready_controller(DriverConfig::for_testing());
        ctrl.port_enable().unwrap();
        assert_eq!(sim.port_enables(), 1);
    }

    #[test]
    fn test_shutdown_completes() {
        let (sim, ctrl) = sim::ready_controller(DriverConfig::for_testing());
        assert_eq!(ctrl.shutdown(), Ok(()));
        assert!(!ctrl.is_ready());
        assert_eq!(sim.shutdowns(), 1);
        assert!(!ctrl.irq.is_vector_enabled(0));
        // a second call is a no-op
        assert_eq!(ctrl.shutdown(), Ok(()));
        assert_eq!(sim.shutdowns(), 1);
    }

    #[test]
    fn test_shutdown_times_out() {
        let (sim, ctrl) = sim::ready_controller(DriverConfig::for_testing());
        sim.ignore_shutdown(true);
        assert_eq!(ctrl.shutdown(), Err(ControllerError::Timeout));
    }

    #[test]
    fn test_shutdown_of_unrecoverable_controller_skipped() {
        let (sim, ctrl) = sim::ready_controller(DriverConfig::for_testing());
        ctrl.mark_unrecoverable();
        let writes = sim.register_writes();
        assert_eq!(ctrl.shutdown(), Err(ControllerError::Unrecoverable));
        assert_eq!(sim.register_writes(), writes);
    }
}
