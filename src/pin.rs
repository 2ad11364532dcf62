use embedded_hal::digital::OutputPin;

/// Output identifier of a channel.
pub type PinId = u8;

/// Pin id reserved for free channel slots.
pub const INVALID_PIN: PinId = PinId::MAX;

/// Logic level driven on a channel output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Level {
    Low,
    High,
}

impl From<bool> for Level {
    fn from(high: bool) -> Self {
        if high { Level::High } else { Level::Low }
    }
}

/// Digital outputs addressed by pin id.
///
/// Called from interrupt context with the engine lock held, so writes must
/// not block.
pub trait PinWriter {
    /// Whether `pin` can be driven at all. Channels on invalid pins are
    /// refused at registration.
    fn is_valid(&self, pin: PinId) -> bool {
        let _ = pin;
        true
    }

    /// Put `pin` in output mode. Called once when a channel is created.
    fn configure_output(&mut self, pin: PinId) {
        let _ = pin;
    }

    /// Drive `pin` to `level`.
    fn write(&mut self, pin: PinId, level: Level);
}

/// Array of `embedded-hal` outputs, addressed by index.
///
/// Pins must already be configured as outputs. Ids past the array are
/// refused at registration. Write errors are ignored since the tick handler
/// has no failure path.
impl<P: OutputPin, const K: usize> PinWriter for [P; K] {
    fn is_valid(&self, pin: PinId) -> bool {
        usize::from(pin) < K
    }

    fn write(&mut self, pin: PinId, level: Level) {
        if let Some(output) = self.get_mut(usize::from(pin)) {
            let _ = match level {
                Level::High => output.set_high(),
                Level::Low => output.set_low(),
            };
        }
    }
}
