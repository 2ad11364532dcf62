use crate::pin::{INVALID_PIN, Level, PinId};
use crate::timebase::Resolution;
use crate::{MAX_FREQUENCY_HZ, PwmCallback, SpwmError};
use core::marker::PhantomData;

const MAX_DUTY_CYCLE: u8 = 100;

pub struct SpwmChannelPeriodBuildState {}
pub struct SpwmChannelDutyCycleBuildState {}
pub struct SpwmChannelFinalizedBuildState {}

/// One slot of the channel table.
#[derive(Clone, Copy)]
pub(crate) struct SpwmChannel {
    pub(crate) pin: PinId,
    pub(crate) period: u32,
    pub(crate) on_time: u32,
    pub(crate) prev_time: u64,
    pub(crate) pin_high: bool,
    pub(crate) enabled: bool,
    pub(crate) on_start: Option<PwmCallback>,
    pub(crate) on_stop: Option<PwmCallback>,
    // 0 means nothing staged
    pub(crate) pending_period: u32,
    pub(crate) pending_on_time: u32,
}

impl SpwmChannel {
    pub(crate) const FREE: Self = Self::free(0);

    pub(crate) const fn free(prev_time: u64) -> Self {
        Self {
            pin: INVALID_PIN,
            period: 0,
            on_time: 0,
            prev_time,
            pin_high: false,
            enabled: false,
            on_start: None,
            on_stop: None,
            pending_period: 0,
            pending_on_time: 0,
        }
    }

    pub(crate) fn is_free(&self) -> bool {
        self.period == 0 && self.pin == INVALID_PIN
    }

    pub(crate) fn snapshot(&self) -> ChannelSnapshot {
        ChannelSnapshot {
            pin: self.pin,
            period: self.period,
            on_time: self.on_time,
            pending: (self.pending_period != 0)
                .then_some((self.pending_period, self.pending_on_time)),
            level: Level::from(self.pin_high),
            enabled: self.enabled,
        }
    }
}

/// Copy of a live channel's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ChannelSnapshot {
    pub pin: PinId,
    pub period: u32,
    pub on_time: u32,
    /// `(period, on_time)` staged for the next rollover
    pub pending: Option<(u32, u32)>,
    /// Last level written by the engine
    pub level: Level,
    pub enabled: bool,
}

/// Validated channel parameters, ready to be registered with an engine.
///
/// Only an engine with the same [`Resolution`] accepts it.
#[derive(Debug, Clone, Copy)]
pub struct ChannelConfig {
    pub(crate) resolution: Resolution,
    pub(crate) pin: PinId,
    pub(crate) period: u32,
    pub(crate) on_time: u32,
    pub(crate) on_start: Option<PwmCallback>,
    pub(crate) on_stop: Option<PwmCallback>,
}

impl ChannelConfig {
    /// Unit of [`ChannelConfig::period`] and [`ChannelConfig::on_time`].
    #[must_use]
    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    #[must_use]
    pub fn pin(&self) -> PinId {
        self.pin
    }

    #[must_use]
    pub fn period(&self) -> u32 {
        self.period
    }

    #[must_use]
    pub fn on_time(&self) -> u32 {
        self.on_time
    }
}

/// Converts a channel frequency into a period in `resolution` units,
/// truncating toward zero.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss
)]
pub(crate) fn period_from_freq_hz(resolution: Resolution, freq_hz: f32) -> Result<u32, SpwmError> {
    // written so that NaN fails too
    if !(freq_hz > 0.0 && freq_hz <= MAX_FREQUENCY_HZ) {
        return Err(SpwmError::InvalidParameter);
    }

    // at least 2 units at the frequency ceiling, saturates at u32::MAX for
    // tiny frequencies
    Ok((resolution.units_per_second() as f32 / freq_hz) as u32)
}

/// Computes `period * duty_cycle / 100`, rejecting a zero period or a duty
/// cycle above 100.
pub(crate) fn on_time_for(period: u32, duty_cycle: u8) -> Result<u32, SpwmError> {
    if period == 0 || duty_cycle > MAX_DUTY_CYCLE {
        return Err(SpwmError::InvalidParameter);
    }

    let on_time = u64::from(period) * u64::from(duty_cycle) / u64::from(MAX_DUTY_CYCLE);

    // on_time <= period, so it always fits
    Ok(u32::try_from(on_time).unwrap_or(period))
}

pub struct SpwmChannelBuilder<T> {
    resolution: Resolution,
    pin: PinId,
    period: u32,
    on_time: u32,
    on_start: Option<PwmCallback>,
    on_stop: Option<PwmCallback>,
    _phantom: PhantomData<T>,
}

impl<T> SpwmChannelBuilder<T> {
    /// Callback fired on every rising edge of the channel.
    pub fn on_start(mut self, on_start: PwmCallback) -> Self {
        self.on_start = Some(on_start);
        self
    }

    /// Callback fired on every falling edge of the channel.
    pub fn on_stop(mut self, on_stop: PwmCallback) -> Self {
        self.on_stop = Some(on_stop);
        self
    }

    pub(crate) fn callbacks(
        mut self,
        on_start: Option<PwmCallback>,
        on_stop: Option<PwmCallback>,
    ) -> Self {
        self.on_start = on_start;
        self.on_stop = on_stop;
        self
    }

    fn transition<U>(self, period: u32, on_time: u32) -> SpwmChannelBuilder<U> {
        SpwmChannelBuilder {
            resolution: self.resolution,
            pin: self.pin,
            period,
            on_time,
            on_start: self.on_start,
            on_stop: self.on_stop,
            _phantom: PhantomData,
        }
    }
}

impl SpwmChannelBuilder<SpwmChannelPeriodBuildState> {
    /// Starts a channel description for `pin`, with periods expressed in
    /// `resolution` units.
    ///
    /// # Errors
    ///
    /// [`SpwmError::InvalidParameter`] if `pin` is [`INVALID_PIN`].
    pub fn new(pin: PinId, resolution: Resolution) -> Result<Self, SpwmError> {
        if pin == INVALID_PIN {
            return Err(SpwmError::InvalidParameter);
        }

        Ok(Self {
            resolution,
            pin,
            period: 0,
            on_time: 0,
            on_start: None,
            on_stop: None,
            _phantom: PhantomData,
        })
    }

    /// Sets the period from a frequency in `(0, MAX_FREQUENCY_HZ]`, e.g.
    /// `0.5` for one pulse every two seconds.
    ///
    /// # Errors
    ///
    /// [`SpwmError::InvalidParameter`] for a frequency that is not positive,
    /// is too high or is NaN.
    pub fn freq_hz(
        self,
        freq_hz: f32,
    ) -> Result<SpwmChannelBuilder<SpwmChannelDutyCycleBuildState>, SpwmError> {
        let period = period_from_freq_hz(self.resolution, freq_hz)?;

        Ok(self.transition(period, 0))
    }

    /// Sets the period directly in timebase units.
    ///
    /// # Errors
    ///
    /// [`SpwmError::InvalidParameter`] for a zero period.
    pub fn period(
        self,
        period: u32,
    ) -> Result<SpwmChannelBuilder<SpwmChannelDutyCycleBuildState>, SpwmError> {
        if period == 0 {
            return Err(SpwmError::InvalidParameter);
        }

        Ok(self.transition(period, 0))
    }
}

impl SpwmChannelBuilder<SpwmChannelDutyCycleBuildState> {
    /// # Errors
    ///
    /// [`SpwmError::InvalidParameter`] if `duty_cycle` is above 100.
    pub fn duty_cycle(
        self,
        duty_cycle: u8,
    ) -> Result<SpwmChannelBuilder<SpwmChannelFinalizedBuildState>, SpwmError> {
        let on_time = on_time_for(self.period, duty_cycle)?;
        let period = self.period;

        Ok(self.transition(period, on_time))
    }
}

impl SpwmChannelBuilder<SpwmChannelFinalizedBuildState> {
    pub fn build(self) -> ChannelConfig {
        ChannelConfig {
            resolution: self.resolution,
            pin: self.pin,
            period: self.period,
            on_time: self.on_time,
            on_start: self.on_start,
            on_stop: self.on_stop,
        }
    }
}
