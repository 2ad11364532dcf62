#![no_std]
mod fmt;

mod channel;
mod pin;
mod timebase;

use core::cell::RefCell;
use critical_section::Mutex;

pub use channel::{
    ChannelConfig, ChannelSnapshot, SpwmChannelBuilder, SpwmChannelDutyCycleBuildState,
    SpwmChannelFinalizedBuildState, SpwmChannelPeriodBuildState,
};
pub use pin::{INVALID_PIN, Level, PinId, PinWriter};
pub use timebase::{Resolution, TickTimer, Timebase};

use channel::{SpwmChannel, on_time_for, period_from_freq_hz};

/// Default size of the channel table.
pub const MAX_CHANNELS: usize = 16;

/// Highest channel frequency accepted by the frequency based entry points.
pub const MAX_FREQUENCY_HZ: f32 = 500.0;

/// Errors that can occur during SPWM operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SpwmError {
    /// Zero period, duty cycle above 100, frequency out of range, invalid pin
    /// or a configuration built for another timebase unit
    InvalidParameter,
    /// No free channel slots available for registration
    NoCapacity,
    /// The pin does not match the one the channel was registered with
    HandleMismatch,
    /// The specified channel index is out of range
    OutOfRange,
}

impl core::fmt::Display for SpwmError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::InvalidParameter => write!(f, "invalid pin, period, frequency or duty cycle"),
            Self::NoCapacity => write!(f, "no free channel slot"),
            Self::HandleMismatch => write!(f, "channel and pin mismatched"),
            Self::OutOfRange => write!(f, "channel index out of range"),
        }
    }
}

/// Callback invoked on a channel edge.
///
/// Runs in the context of [`Spwm::irq_handler`], usually an interrupt, after
/// the channel table lock has been released. Must not block.
pub type PwmCallback = fn();

/// Unique identifier for a registered channel.
pub type ChannelId = usize;

struct ChannelTable<W, const N: usize> {
    slots: [SpwmChannel; N],
    // None until the table has been initialized
    num_channels: Option<usize>,
    pins: W,
}

impl<W, const N: usize> ChannelTable<W, N> {
    fn reset(&mut self, now: u64) {
        for slot in &mut self.slots {
            *slot = SpwmChannel::free(now);
        }

        self.num_channels = Some(0);
    }

    fn first_free_slot(&self) -> Option<usize> {
        if self.num_channels.unwrap_or(0) >= N {
            return None;
        }

        self.slots.iter().position(SpwmChannel::is_free)
    }
}

/// Software PWM engine multiplexing up to `N` channels onto one periodic tick.
///
/// All state lives behind a [`critical_section::Mutex`], so a single instance
/// (typically a `static`) is shared between the timer interrupt calling
/// [`Spwm::irq_handler`] and application code managing channels.
pub struct Spwm<T, W, const N: usize = MAX_CHANNELS> {
    table: Mutex<RefCell<ChannelTable<W, N>>>,
    timebase: T,
}

impl<T: Timebase, W: PinWriter, const N: usize> Spwm<T, W, N> {
    #[must_use]
    pub const fn new(timebase: T, pins: W) -> Self {
        Self {
            table: Mutex::new(RefCell::new(ChannelTable {
                slots: [SpwmChannel::FREE; N],
                num_channels: None,
                pins,
            })),
            timebase,
        }
    }

    /// Frees every channel and restarts all phases at the current time.
    ///
    /// Runs implicitly on the first registration. Calling it again performs a
    /// full reset.
    pub fn init(&self) {
        critical_section::with(|cs| {
            let now = self.timebase.now();

            self.table.borrow_ref_mut(cs).reset(now);
        });

        info!("channel table initialized with {} slots", N);
    }

    /// Time source shared by all channels.
    pub fn timebase(&self) -> &T {
        &self.timebase
    }

    /// Starts describing a channel on `pin`, in this engine's timebase unit.
    ///
    /// # Errors
    ///
    /// [`SpwmError::InvalidParameter`] if `pin` is [`INVALID_PIN`].
    pub fn create_channel(
        &self,
        pin: PinId,
    ) -> Result<SpwmChannelBuilder<SpwmChannelPeriodBuildState>, SpwmError> {
        SpwmChannelBuilder::new(pin, T::RESOLUTION)
    }

    /// Places a channel in the first free slot and starts it immediately.
    ///
    /// The output is driven high right away (low for a 0 % duty cycle). That
    /// first rising edge is implicit: callbacks only ever run from
    /// [`Spwm::irq_handler`], so `on_start` first fires at the start of the
    /// second cycle.
    ///
    /// # Errors
    ///
    /// [`SpwmError::InvalidParameter`] if `config` was built for another
    /// [`Resolution`] or the pin writer cannot drive its pin,
    /// [`SpwmError::NoCapacity`] when all `N` slots are in use.
    pub fn register_channel(&self, config: ChannelConfig) -> Result<ChannelId, SpwmError> {
        let starts_high = config.on_time != 0;
        let registered = critical_section::with(|cs| -> Result<(ChannelId, u64), SpwmError> {
            if config.resolution != T::RESOLUTION {
                return Err(SpwmError::InvalidParameter);
            }

            let mut table = self.table.borrow_ref_mut(cs);

            if !table.pins.is_valid(config.pin) {
                return Err(SpwmError::InvalidParameter);
            }

            if table.num_channels.is_none() {
                table.reset(self.timebase.now());
            }

            let channel_id = table.first_free_slot().ok_or(SpwmError::NoCapacity)?;
            let now = self.timebase.now();

            table.pins.configure_output(config.pin);
            table.pins.write(config.pin, Level::from(starts_high));
            table.slots[channel_id] = SpwmChannel {
                pin: config.pin,
                period: config.period,
                on_time: config.on_time,
                prev_time: now,
                pin_high: starts_high,
                enabled: true,
                on_start: config.on_start,
                on_stop: config.on_stop,
                pending_period: 0,
                pending_on_time: 0,
            };
            table.num_channels = table.num_channels.map(|count| count + 1);

            Ok((channel_id, now))
        });

        match registered {
            Ok((channel_id, now)) => {
                debug!(
                    "channel {}: pin {} period {} on time {} start {}",
                    channel_id,
                    config.pin,
                    config.period,
                    config.on_time,
                    now
                );

                Ok(channel_id)
            }
            Err(err) => {
                warn!("cannot register channel for pin {}: {}", config.pin, err);

                Err(err)
            }
        }
    }

    /// Registers a channel running at `freq_hz`. Fractional frequencies are
    /// fine, anything in `(0, MAX_FREQUENCY_HZ]` is accepted.
    ///
    /// # Errors
    ///
    /// [`SpwmError::InvalidParameter`] for an invalid pin, frequency or duty
    /// cycle, [`SpwmError::NoCapacity`] when the table is full.
    pub fn set_pwm(
        &self,
        pin: PinId,
        freq_hz: f32,
        duty_cycle: u8,
        on_start: Option<PwmCallback>,
        on_stop: Option<PwmCallback>,
    ) -> Result<ChannelId, SpwmError> {
        let config = self
            .create_channel(pin)
            .and_then(|builder| builder.freq_hz(freq_hz))
            .and_then(|builder| builder.duty_cycle(duty_cycle))
            .inspect_err(|err| {
                warn!("pin {}: {} Hz at {}%: {}", pin, freq_hz, duty_cycle, err);
            })?
            .callbacks(on_start, on_stop)
            .build();

        self.register_channel(config)
    }

    /// Registers a channel with a period given in timebase units.
    ///
    /// # Errors
    ///
    /// [`SpwmError::InvalidParameter`] for an invalid pin, zero period or duty
    /// cycle above 100, [`SpwmError::NoCapacity`] when the table is full.
    pub fn set_pwm_period(
        &self,
        pin: PinId,
        period: u32,
        duty_cycle: u8,
        on_start: Option<PwmCallback>,
        on_stop: Option<PwmCallback>,
    ) -> Result<ChannelId, SpwmError> {
        let config = self
            .create_channel(pin)
            .and_then(|builder| builder.period(period))
            .and_then(|builder| builder.duty_cycle(duty_cycle))
            .inspect_err(|err| {
                warn!("pin {}: period {} at {}%: {}", pin, period, duty_cycle, err);
            })?
            .callbacks(on_start, on_stop)
            .build();

        self.register_channel(config)
    }

    /// Stages a new frequency and duty cycle, applied at the end of the
    /// current period.
    ///
    /// # Errors
    ///
    /// See [`Spwm::modify_channel_period`]; additionally
    /// [`SpwmError::InvalidParameter`] for a frequency outside
    /// `(0, MAX_FREQUENCY_HZ]`.
    pub fn modify_channel(
        &self,
        channel_id: ChannelId,
        pin: PinId,
        freq_hz: f32,
        duty_cycle: u8,
    ) -> Result<(), SpwmError> {
        let period = period_from_freq_hz(T::RESOLUTION, freq_hz).inspect_err(|err| {
            warn!("channel {}: {} Hz: {}", channel_id, freq_hz, err);
        })?;

        self.modify_channel_period(channel_id, pin, period, duty_cycle)
    }

    /// Stages a new period and duty cycle, applied at the end of the current
    /// period so the pulse in flight is never cut short.
    ///
    /// `pin` must be the pin the channel was registered with, which catches
    /// stale ids whose slot has been reused.
    ///
    /// # Errors
    ///
    /// [`SpwmError::InvalidParameter`] for a zero period or duty cycle above
    /// 100, [`SpwmError::OutOfRange`] for an id beyond the table,
    /// [`SpwmError::HandleMismatch`] if the slot is free or holds another pin.
    pub fn modify_channel_period(
        &self,
        channel_id: ChannelId,
        pin: PinId,
        period: u32,
        duty_cycle: u8,
    ) -> Result<(), SpwmError> {
        let staged = on_time_for(period, duty_cycle).and_then(|on_time| {
            critical_section::with(|cs| -> Result<u32, SpwmError> {
                let mut table = self.table.borrow_ref_mut(cs);
                let slot = table
                    .slots
                    .get_mut(channel_id)
                    .ok_or(SpwmError::OutOfRange)?;

                if slot.is_free() || slot.pin != pin {
                    return Err(SpwmError::HandleMismatch);
                }

                slot.pending_period = period;
                slot.pending_on_time = on_time;

                Ok(on_time)
            })
        });

        match staged {
            Ok(on_time) => {
                debug!(
                    "channel {}: pin {} new period {} new on time {}",
                    channel_id,
                    pin,
                    period,
                    on_time
                );

                Ok(())
            }
            Err(err) => {
                warn!("cannot modify channel {} (pin {}): {}", channel_id, pin, err);

                Err(err)
            }
        }
    }

    /// Frees the channel slot. The output is driven low if it was high.
    ///
    /// Deleting a free slot does nothing.
    ///
    /// # Errors
    ///
    /// [`SpwmError::OutOfRange`] for an id beyond the table.
    pub fn delete_channel(&self, channel_id: ChannelId) -> Result<(), SpwmError> {
        let deleted = critical_section::with(|cs| -> Result<bool, SpwmError> {
            let mut guard = self.table.borrow_ref_mut(cs);
            let table = &mut *guard;
            let slot = table
                .slots
                .get_mut(channel_id)
                .ok_or(SpwmError::OutOfRange)?;

            if slot.is_free() {
                return Ok(false);
            }

            if slot.pin_high {
                table.pins.write(slot.pin, Level::Low);
            }

            *slot = SpwmChannel::FREE;
            table.num_channels = table.num_channels.map(|count| count.saturating_sub(1));

            Ok(true)
        })?;

        if deleted {
            debug!("channel {} deleted", channel_id);
        }

        Ok(())
    }

    /// Restarts the current cycle of the channel from phase zero.
    ///
    /// # Errors
    ///
    /// [`SpwmError::OutOfRange`] for an id beyond the table.
    pub fn restart_channel(&self, channel_id: ChannelId) -> Result<(), SpwmError> {
        let now = self.timebase.now();

        self.update_channel(channel_id, |slot| slot.prev_time = now)
    }

    /// # Errors
    ///
    /// [`SpwmError::OutOfRange`] for an id beyond the table.
    pub fn enable(&self, channel_id: ChannelId) -> Result<(), SpwmError> {
        self.update_channel(channel_id, |slot| slot.enabled = true)
    }

    /// Stops evaluating the channel. Its configuration and output level are
    /// kept as they are.
    ///
    /// # Errors
    ///
    /// [`SpwmError::OutOfRange`] for an id beyond the table.
    pub fn disable(&self, channel_id: ChannelId) -> Result<(), SpwmError> {
        self.update_channel(channel_id, |slot| slot.enabled = false)
    }

    /// # Errors
    ///
    /// [`SpwmError::OutOfRange`] for an id beyond the table.
    pub fn toggle(&self, channel_id: ChannelId) -> Result<(), SpwmError> {
        self.update_channel(channel_id, |slot| slot.enabled = !slot.enabled)
    }

    /// Enables every registered channel.
    pub fn enable_all(&self) {
        self.set_all_enabled(true);
    }

    /// Disables every registered channel, leaving outputs at their level.
    pub fn disable_all(&self) {
        self.set_all_enabled(false);
    }

    /// `false` for free slots and ids beyond the table.
    pub fn is_enabled(&self, channel_id: ChannelId) -> bool {
        critical_section::with(|cs| {
            self.table
                .borrow_ref(cs)
                .slots
                .get(channel_id)
                .is_some_and(|slot| slot.enabled)
        })
    }

    /// Number of registered channels.
    pub fn active_channel_count(&self) -> usize {
        critical_section::with(|cs| self.table.borrow_ref(cs).num_channels.unwrap_or(0))
    }

    /// Number of free slots left.
    pub fn available_capacity(&self) -> usize {
        N - self.active_channel_count()
    }

    /// State of a registered channel, `None` for free slots and ids beyond the
    /// table.
    pub fn channel(&self, channel_id: ChannelId) -> Option<ChannelSnapshot> {
        critical_section::with(|cs| {
            self.table
                .borrow_ref(cs)
                .slots
                .get(channel_id)
                .filter(|slot| !slot.is_free())
                .map(SpwmChannel::snapshot)
        })
    }

    /// Advances every enabled channel. Call from the periodic timer interrupt.
    ///
    /// Elapsed time is computed modulo [`Timebase::WRAP_MASK`], so a clock
    /// that wraps at its native width keeps every phase intact.
    ///
    /// Each channel is in exactly one phase per tick:
    /// - high while `elapsed <= on_time` (never for a 0 % duty cycle),
    /// - low while `elapsed < period`,
    /// - rollover otherwise: the phase restarts at the current time and a
    ///   staged period/duty change, if any, replaces the live one. The output
    ///   is left untouched until the next tick.
    ///
    /// Edge callbacks run after the table lock is released, in channel order.
    pub fn irq_handler(&self) {
        let mut fired: heapless::Vec<PwmCallback, N> = heapless::Vec::new();

        critical_section::with(|cs| {
            let mut guard = self.table.borrow_ref_mut(cs);
            let table = &mut *guard;
            let now = self.timebase.now();

            for slot in &mut table.slots {
                if slot.is_free() || !slot.enabled {
                    continue;
                }

                let elapsed = now.wrapping_sub(slot.prev_time) & T::WRAP_MASK;
                let edge = if slot.on_time != 0 && elapsed <= u64::from(slot.on_time) {
                    if slot.pin_high {
                        None
                    } else {
                        table.pins.write(slot.pin, Level::High);
                        slot.pin_high = true;
                        slot.on_start
                    }
                } else if elapsed < u64::from(slot.period) {
                    if slot.pin_high {
                        table.pins.write(slot.pin, Level::Low);
                        slot.pin_high = false;
                        slot.on_stop
                    } else {
                        None
                    }
                } else {
                    slot.prev_time = now;

                    if slot.pending_period != 0 {
                        slot.period = slot.pending_period;
                        slot.on_time = slot.pending_on_time;
                        slot.pending_period = 0;
                        slot.pending_on_time = 0;
                    }

                    None
                };

                if let Some(callback) = edge {
                    // at most one edge per slot, capacity is N
                    let _ = fired.push(callback);
                }
            }
        });

        for callback in fired {
            callback();
        }
    }

    fn update_channel(
        &self,
        channel_id: ChannelId,
        update: impl FnOnce(&mut SpwmChannel),
    ) -> Result<(), SpwmError> {
        critical_section::with(|cs| -> Result<(), SpwmError> {
            let mut table = self.table.borrow_ref_mut(cs);
            let slot = table
                .slots
                .get_mut(channel_id)
                .ok_or(SpwmError::OutOfRange)?;

            if !slot.is_free() {
                update(slot);
            }

            Ok(())
        })
    }

    fn set_all_enabled(&self, enabled: bool) {
        critical_section::with(|cs| {
            let mut table = self.table.borrow_ref_mut(cs);

            for slot in table.slots.iter_mut().filter(|slot| slot.period != 0) {
                slot.enabled = enabled;
            }
        });

        trace!("all channels enabled: {}", enabled);
    }
}
