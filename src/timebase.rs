/// Unit of every period and timestamp handled by one engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Resolution {
    /// Periods and timestamps are in microseconds
    Micros,
    /// Periods and timestamps are in milliseconds
    Millis,
}

impl Resolution {
    /// Number of timebase units in one second.
    #[must_use]
    pub const fn units_per_second(self) -> u32 {
        match self {
            Self::Micros => 1_000_000,
            Self::Millis => 1_000,
        }
    }
}

/// Monotonic time source read by the engine on every tick.
///
/// The resolution is tied to the implementing type, so all channels of an
/// engine share the same unit.
pub trait Timebase {
    /// Unit of the values returned by [`Timebase::now`].
    const RESOLUTION: Resolution;

    /// Mask of the bits [`Timebase::now`] actually counts with. A counter that
    /// wraps at 32 bits sets this to `u32::MAX as u64`, so elapsed time stays
    /// correct across the wrap.
    const WRAP_MASK: u64 = u64::MAX;

    /// Current time in [`Timebase::RESOLUTION`] units, wrapping at
    /// [`Timebase::WRAP_MASK`].
    fn now(&self) -> u64;
}

impl<T: Timebase + ?Sized> Timebase for &T {
    const RESOLUTION: Resolution = T::RESOLUTION;
    const WRAP_MASK: u64 = T::WRAP_MASK;

    fn now(&self) -> u64 {
        (**self).now()
    }
}

/// Hardware timer that periodically fires the interrupt driving
/// [`Spwm::irq_handler`](crate::Spwm::irq_handler).
///
/// The tick rate is independent of channel periods and duty cycles. Anything
/// between 10 and 100 times the fastest channel frequency gives usable edge
/// resolution.
pub trait TickTimer {
    /// Implementation specific error.
    type Error;

    /// Program the timer to fire at `tick_hz`.
    ///
    /// # Errors
    ///
    /// Returns an error if the frequency cannot be derived from the timer clock.
    fn configure(&mut self, tick_hz: u32) -> Result<(), Self::Error>;

    /// Enable the timer interrupt.
    fn start(&mut self);

    /// Disable the timer interrupt.
    fn stop(&mut self);

    /// Halt the counter without losing its value.
    fn pause(&mut self);

    /// Continue counting after [`TickTimer::pause`].
    fn resume(&mut self);
}
