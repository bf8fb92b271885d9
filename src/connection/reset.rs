//! Control-line sequencing for restarting the device
//!
//! The serial adapter's DTR and RTS outputs gate the chip's EN (enable) and
//! IO0 (boot-mode strap) pins through an inverting transistor pair:
//!
//! ```text
//! DTR   RTS  ->  EN   IO0
//!  1     1       1     1
//!  0     0       1     1
//!  1     0       0     1
//!  0     1       1     0
//! ```
//!
//! The chip samples IO0 only while EN is low, so the signal calls below must
//! run strictly in order and the delays in between are blocking.

use std::{thread::sleep, time::Duration};

use log::debug;

use crate::{
    error::Error,
    state::{EventSink, SessionState},
    transport::Transport,
};

/// Time the chip is held in reset.
const RESET_HOLD_DELAY: Duration = Duration::from_millis(100);
/// Time the boot strap is kept asserted after reset is released.
const BOOT_STRAP_DELAY: Duration = Duration::from_millis(50);

/// Pulse the device through reset with the boot strap asserted.
///
/// Emits `Restarting`, then: DTR low, RTS high (EN low, chip in reset), wait,
/// DTR high, RTS low (EN high, IO0 strapped), wait, DTR low. A failed signal
/// write surfaces [`Error::Signal`] and aborts the rest of the sequence.
pub(crate) fn reset_device(transport: &mut dyn Transport, events: &EventSink) -> Result<(), Error> {
    debug!("resetting device");
    events.state(SessionState::Restarting);

    set_dtr(transport, false)?; // IO0 = HIGH
    set_rts(transport, true)?; // EN = LOW, chip in reset

    sleep(RESET_HOLD_DELAY);

    set_dtr(transport, true)?; // IO0 = LOW
    set_rts(transport, false)?; // EN = HIGH, chip out of reset

    sleep(BOOT_STRAP_DELAY);

    set_dtr(transport, false)?; // IO0 = HIGH, done

    Ok(())
}

/// Pulse EN without touching the boot strap: a plain reboot into run mode.
pub(crate) fn restart_into_run_mode(
    transport: &mut dyn Transport,
    events: &EventSink,
) -> Result<(), Error> {
    debug!("restarting device into run mode");
    events.state(SessionState::Restarting);

    set_rts(transport, true)?; // EN = LOW, chip in reset

    sleep(RESET_HOLD_DELAY);

    set_rts(transport, false)?; // EN = HIGH, chip out of reset

    Ok(())
}

fn set_dtr(transport: &mut dyn Transport, level: bool) -> Result<(), Error> {
    transport.set_signals(Some(level), None).map_err(Error::Signal)
}

fn set_rts(transport: &mut dyn Transport, level: bool) -> Result<(), Error> {
    transport.set_signals(None, Some(level)).map_err(Error::Signal)
}
