//! Timers that are used by the protocol layer and policy engine.
//!
//! Timers never block. They record a start time and period, and are polled
//! against the current time of a [`Clock`].

/// The clock trait to implement by the user application.
pub trait Clock {
    /// The current time in milliseconds.
    ///
    /// The value may wrap around at `u32::MAX`.
    fn now(&self) -> u32;
}

/// How often an expired timer reports expiry before it disables itself.
const EXPIRY_REPORTS: u8 = 3;

/// A polled countdown timer.
///
/// A period of zero is the disabled state.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Timer {
    start: u32,
    period: u32,
    reports_left: u8,
}

impl Timer {
    /// A disabled timer.
    pub const fn new() -> Self {
        Self {
            start: 0,
            period: 0,
            reports_left: 0,
        }
    }

    /// Arm the timer for `period` milliseconds, starting `now`.
    ///
    /// A zero period is coerced to one millisecond.
    pub fn start(&mut self, now: u32, period: u32) {
        self.start = now;
        self.period = period.max(1);
        self.reports_left = EXPIRY_REPORTS;
    }

    /// Arm the timer with the duration of a timer type.
    pub fn start_type(&mut self, now: u32, timer_type: TimerType) {
        self.start(now, timer_type.duration_ms());
    }

    /// Restart the current period from `now`.
    pub fn restart(&mut self, now: u32) {
        self.start = now;
    }

    /// Disable the timer.
    pub fn disable(&mut self) {
        self.start = 0;
        self.period = 0;
    }

    /// Whether the timer is disabled.
    pub fn disabled(&self) -> bool {
        self.period == 0
    }

    fn elapsed(&self, now: u32) -> bool {
        !self.disabled() && now.wrapping_sub(self.start) >= self.period
    }

    /// Whether the timer has expired.
    ///
    /// An expired timer disables itself after it was observed a few times.
    pub fn expired(&mut self, now: u32) -> bool {
        if !self.elapsed(now) {
            return false;
        }

        if self.reports_left == 0 {
            self.disable();
        } else {
            self.reports_left -= 1;
        }
        true
    }

    /// Milliseconds until expiry.
    ///
    /// Zero if disabled, one if expired but not yet handled.
    pub fn remaining(&self, now: u32) -> u32 {
        if self.disabled() {
            0
        } else if self.elapsed(now) {
            1
        } else {
            self.period - now.wrapping_sub(self.start)
        }
    }
}

/// Types of timers that are used for timeouts.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TimerType {
    BISTContMode,
    ChunkSenderResponse,
    GoodCRCDelay,
    PPSRequest,
    PPSTimeout,
    PSHardReset,
    PSHardResetMax,
    PSSourceOff,
    PSSourceOn,
    PSTransition,
    Retry,
    Safe0V,
    SenderResponse,
    SinkRequest,
    SourceRiseTimeout,
    SrcRecover,
    SrcRecoverMax,
    SrcTransition,
    SrcTurnOn,
    SwapSourceStart,
    TypeCSendSourceCap,
    TypeCSinkWaitCap,
    VBusSwitchDelay,
    VCONNSourceOn,
    VCONNTransition,
}

impl TimerType {
    /// The timeout in milliseconds, as given by the USB PD specification.
    pub const fn duration_ms(self) -> u32 {
        match self {
            TimerType::BISTContMode => 45,
            TimerType::ChunkSenderResponse => 27,
            TimerType::GoodCRCDelay => 5,
            TimerType::PPSRequest => 5000,
            TimerType::PPSTimeout => 13500,
            TimerType::PSHardReset => 30,
            TimerType::PSHardResetMax => 35,
            TimerType::PSSourceOff => 835,
            TimerType::PSSourceOn => 435,
            TimerType::PSTransition => 500,
            TimerType::Retry => 3,
            TimerType::Safe0V => 650,
            TimerType::SenderResponse => 30,
            TimerType::SinkRequest => 100,
            TimerType::SourceRiseTimeout => 350,
            TimerType::SrcRecover => 660,
            TimerType::SrcRecoverMax => 1000,
            TimerType::SrcTransition => 25,
            TimerType::SrcTurnOn => 275,
            TimerType::SwapSourceStart => 20,
            TimerType::TypeCSendSourceCap => 150,
            TimerType::TypeCSinkWaitCap => 465,
            TimerType::VBusSwitchDelay => 5,
            TimerType::VCONNSourceOn => 50,
            TimerType::VCONNTransition => 2,
        }
    }
}
