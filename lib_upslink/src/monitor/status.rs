//! Status flag set for a monitored UPS, plus the wire-token mapping.

use bitflags::bitflags;

bitflags! {
    /// Last observed condition of one UPS, as the monitor tracks it.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Status: u16 {
        /// UPS is on line power (`OL`).
        const ONLINE    = 1 << 0;
        /// UPS is running on battery (`OB`).
        const ONBATT    = 1 << 1;
        /// Battery is low (`LB`).
        const LOWBATT   = 1 << 2;
        /// Forced shutdown flag is raised (`FSD`).
        const FSD       = 1 << 3;
        /// We are logged into this UPS on the server.
        const LOGGED_IN = 1 << 4;
        /// A client session to the server is established.
        const CONNECTED = 1 << 5;
        /// Battery calibration in progress (`CAL`).
        const CAL       = 1 << 6;
        /// Administratively switched off (`OFF`).
        const OFF       = 1 << 7;
        /// Running on bypass, battery out of the circuit (`BYPASS`).
        const BYPASS    = 1 << 8;
    }
}

impl Status {
    /// Flags that make an UPS "hot": while any is set the monitor polls
    /// at the alert frequency, since the device may vanish at any moment.
    pub const HOT: Status = Status::ONBATT
        .union(Status::OFF)
        .union(Status::BYPASS)
        .union(Status::CAL);

    /// True while any hot-state flag is set.
    pub fn is_hot(self) -> bool {
        self.intersects(Self::HOT)
    }
}

/// One wire token from a `ups.status` value. Unknown tokens are dropped
/// by the interpreter, so this only covers what the monitor acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusToken {
    Online,
    OnBattery,
    LowBattery,
    ReplaceBattery,
    Calibrating,
    Off,
    Bypass,
    ForcedShutdown,
}

impl StatusToken {
    /// Map one status word; tokens are matched case-insensitively the
    /// way the rest of the protocol is.
    pub fn parse(word: &str) -> Option<Self> {
        if word.eq_ignore_ascii_case("OL") {
            Some(Self::Online)
        } else if word.eq_ignore_ascii_case("OB") {
            Some(Self::OnBattery)
        } else if word.eq_ignore_ascii_case("LB") {
            Some(Self::LowBattery)
        } else if word.eq_ignore_ascii_case("RB") {
            Some(Self::ReplaceBattery)
        } else if word.eq_ignore_ascii_case("CAL") {
            Some(Self::Calibrating)
        } else if word.eq_ignore_ascii_case("OFF") {
            Some(Self::Off)
        } else if word.eq_ignore_ascii_case("BYPASS") {
            Some(Self::Bypass)
        } else if word.eq_ignore_ascii_case("FSD") {
            Some(Self::ForcedShutdown)
        } else {
            None
        }
    }
}
