//! Bank-level DRAM controller.
//!
//! The controller fans requests from its upper-level channels out to the
//! DRAM channels by the channel bits of the address, and each channel runs
//! its own bank scheduler. See [`channel::DramChannel`] for the per-channel
//! timing model.

/// Per-channel bank scheduling.
pub mod channel;

use crate::channel::ChannelRef;
use crate::common::addr::Address;
use crate::common::bits::{bitmask, lg2};
use crate::common::chrono::{Picos, TimePoint};
use crate::common::constants::{BLOCK_SIZE, LOG2_BLOCK_SIZE};
use crate::common::error::SimError;

use self::channel::{DramChannel, DramChannelParams, DramRequest, DramSlicer};

/// Static parameters of the controller and its channels.
pub struct DramParams {
    /// Number of channels.
    pub channels: usize,
    /// Ranks per channel.
    pub ranks: usize,
    /// Banks per rank.
    pub banks: usize,
    /// Rows per bank.
    pub rows: usize,
    /// Columns per row.
    pub columns: usize,
    /// Data bus width in bytes.
    pub channel_width: u64,
    /// Read queue capacity per channel.
    pub rq_size: usize,
    /// Write queue capacity per channel.
    pub wq_size: usize,
    /// Row precharge time.
    pub t_rp: Picos,
    /// Row-to-column delay.
    pub t_rcd: Picos,
    /// Column access strobe time.
    pub t_cas: Picos,
    /// Full-array refresh period.
    pub refresh_period: Picos,
    /// Rows refreshed per refresh round.
    pub rows_per_refresh: usize,
    /// Bus turnaround penalty.
    pub turnaround: Picos,
    /// Clock period of the controller and channels.
    pub period: Picos,
}

/// The DRAM controller.
pub struct MemoryController {
    channels: Vec<DramChannel>,
    upper_levels: Vec<ChannelRef>,
    channel_bits: u32,
    blocks_per_channel: u64,
    period: Picos,
}

impl MemoryController {
    /// Builds a controller fed by the given upper-level channels.
    pub fn new(params: &DramParams, upper_levels: Vec<ChannelRef>) -> Self {
        let slicer = DramSlicer::new(
            LOG2_BLOCK_SIZE + lg2(params.channels as u64),
            params.banks,
            params.columns,
            params.ranks,
            params.rows,
        );
        let dbus_return_time = params.period.scale_ceil(BLOCK_SIZE, params.channel_width);
        let channels = (0..params.channels)
            .map(|i| {
                DramChannel::new(DramChannelParams {
                    name: format!("Channel {i}"),
                    rows: params.rows,
                    columns: params.columns,
                    ranks: params.ranks,
                    banks: params.banks,
                    rq_size: params.rq_size,
                    wq_size: params.wq_size,
                    t_rp: params.t_rp,
                    t_rcd: params.t_rcd,
                    t_cas: params.t_cas,
                    refresh_period: params.refresh_period,
                    rows_per_refresh: params.rows_per_refresh,
                    turnaround: params.turnaround,
                    dbus_return_time,
                    slicer,
                })
            })
            .collect();
        Self {
            channels,
            upper_levels,
            channel_bits: lg2(params.channels as u64),
            blocks_per_channel: (params.rows * params.columns * params.ranks * params.banks)
                as u64,
            period: params.period,
        }
    }

    /// Channel index of `address`.
    pub const fn dram_get_channel(&self, address: Address) -> usize {
        ((address.value() >> LOG2_BLOCK_SIZE) & bitmask(self.channel_bits)) as usize
    }

    /// Total capacity in bytes.
    pub fn size(&self) -> u64 {
        self.blocks_per_channel * self.channels.len() as u64 * BLOCK_SIZE
    }

    /// Shared access to the channels, e.g. for statistics.
    pub fn channels(&self) -> &[DramChannel] {
        &self.channels
    }

    /// Exclusive access to the channels.
    pub fn channels_mut(&mut self) -> &mut [DramChannel] {
        &mut self.channels
    }

    /// Sets the warmup flag on every channel.
    pub fn set_warmup(&mut self, warmup: bool) {
        for chan in &mut self.channels {
            chan.set_warmup(warmup);
        }
    }

    /// Moves requests from the upper channels into the DRAM queues.
    fn initiate_requests(&mut self, now: TimePoint) {
        let uppers: Vec<ChannelRef> = self.upper_levels.clone();
        for ul in &uppers {
            ul.borrow_mut().check_collision();

            loop {
                let front = ul.borrow().rq_front().cloned();
                let Some(req) = front else { break };
                let chan = self.dram_get_channel(req.address);
                if self.channels[chan].add_rq(DramRequest::new(&req, Some(ul), now)) {
                    let _ = ul.borrow_mut().pop_rq();
                } else {
                    break;
                }
            }

            loop {
                let front = ul.borrow().pq_front().cloned();
                let Some(req) = front else { break };
                let chan = self.dram_get_channel(req.address);
                if self.channels[chan].add_rq(DramRequest::new(&req, Some(ul), now)) {
                    let _ = ul.borrow_mut().pop_pq();
                } else {
                    break;
                }
            }

            loop {
                let front = ul.borrow().wq_front().cloned();
                let Some(req) = front else { break };
                let chan = self.dram_get_channel(req.address);
                if self.channels[chan].add_wq(DramRequest::new(&req, None, now)) {
                    let _ = ul.borrow_mut().pop_wq();
                } else {
                    break;
                }
            }
        }
    }

    /// Advances the controller and every channel by one tick.
    ///
    /// # Errors
    ///
    /// Infallible today; the signature matches the operable contract.
    pub fn operate(&mut self, now: TimePoint) -> Result<u64, SimError> {
        let mut progress = 0_u64;
        self.initiate_requests(now);
        for chan in &mut self.channels {
            progress += chan.operate(now);
        }
        Ok(progress)
    }

    /// Clock period of the DRAM clock domain.
    pub const fn period(&self) -> Picos {
        self.period
    }

    /// Starts a new statistics phase on every channel.
    pub fn begin_phase(&mut self) {
        for chan in &mut self.channels {
            chan.begin_phase();
        }
    }

    /// Freezes region-of-interest statistics on every channel.
    pub fn end_phase(&mut self) {
        for chan in &mut self.channels {
            chan.end_phase();
        }
    }

    /// Dumps queue state for deadlock diagnosis.
    pub fn print_deadlock(&self) {
        for chan in &self.channels {
            chan.print_deadlock();
        }
    }
}
