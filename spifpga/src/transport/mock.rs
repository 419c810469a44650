//! Mock controller implementation used in testing the engine

use super::{
    Controller,
    Status,
    Transfer,
};
use crate::{
    config::Settings,
    lock,
};
use spiframe::{
    Command,
    Frame,
    FRAME_SIZE,
};
use std::{
    collections::HashMap,
    sync::{
        Arc,
        Condvar,
        Mutex,
    },
};

/// What the mock saw of a single transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub len: usize,
    /// The outbound bytes, if the transfer transmitted
    pub tx: Option<Vec<u8>>,
    pub rx: bool,
    pub cs_change: bool,
    pub bits_per_word: u8,
    pub delay_usecs: u16,
    pub speed_hz: u32,
}

#[derive(Debug, Default)]
struct State {
    /// Word registers by byte address. Missing entries read as zero.
    registers: HashMap<u32, u32>,
    history: Vec<Vec<Record>>,
    /// Transactions to let through before failing one, and the status to fail it with
    fail: Option<(usize, Status)>,
    reject_setup: Option<Status>,
    applied: Option<Settings>,
}

/// Holds transactions inside the controller until it is opened
#[derive(Debug, Default)]
pub struct Gate {
    state: Mutex<GateState>,
    cond: Condvar,
}

#[derive(Debug, Default)]
struct GateState {
    open: bool,
    waiting: usize,
}

impl Gate {
    /// Let every held and future transaction through
    pub fn open(&self) {
        lock(&self.state).open = true;
        self.cond.notify_all();
    }

    /// Block until `n` transactions are being held
    pub fn wait_for(&self, n: usize) {
        let mut state = lock(&self.state);
        while state.waiting < n {
            state = self
                .cond
                .wait(state)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
    }

    fn pass(&self) {
        let mut state = lock(&self.state);
        state.waiting += 1;
        self.cond.notify_all();
        while !state.open {
            state = self
                .cond
                .wait(state)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
        state.waiting -= 1;
    }
}

/// A controller with a simulated FPGA on the other end, useful for testing.
///
/// Every 14 byte transfer carrying a known command is treated as a register access against a
/// sparse word memory. Anything else is looped back. Clones share the same state, so a test can
/// keep one to inspect what the engine sent.
#[derive(Debug, Clone, Default)]
pub struct Mock {
    state: Arc<Mutex<State>>,
    gate: Option<Arc<Gate>>,
}

impl Mock {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A mock that holds every transaction until the returned gate is opened
    #[must_use]
    pub fn gated() -> (Self, Arc<Gate>) {
        let gate = Arc::new(Gate::default());
        (
            Self {
                gate: Some(gate.clone()),
                ..Default::default()
            },
            gate,
        )
    }

    /// Preload a register
    pub fn poke(&self, addr: u32, word: u32) {
        lock(&self.state).registers.insert(addr, word);
    }

    /// Inspect a register, `None` if it was never written
    #[must_use]
    pub fn peek(&self, addr: u32) -> Option<u32> {
        lock(&self.state).registers.get(&addr).copied()
    }

    /// Number of transactions submitted so far, including failed ones
    #[must_use]
    pub fn transactions(&self) -> usize {
        lock(&self.state).history.len()
    }

    /// Every transaction submitted so far
    #[must_use]
    pub fn history(&self) -> Vec<Vec<Record>> {
        lock(&self.state).history.clone()
    }

    /// Fail the next transaction with `code`
    pub fn fail_next(&self, code: Status) {
        self.fail_after(0, code);
    }

    /// Let `n` transactions through, then fail the one after with `code`
    pub fn fail_after(&self, n: usize, code: Status) {
        lock(&self.state).fail = Some((n, code));
    }

    /// Reject every setup call with `code` until cleared with `None`
    pub fn reject_setup(&self, code: Option<Status>) {
        lock(&self.state).reject_setup = code;
    }

    /// The last settings accepted by [`Controller::setup`]
    #[must_use]
    pub fn applied(&self) -> Option<Settings> {
        lock(&self.state).applied
    }
}

impl State {
    /// Produce the bytes the FPGA shifts back for `outbound`
    fn respond(&mut self, outbound: &[u8]) -> Vec<u8> {
        if outbound.len() == FRAME_SIZE {
            if let Ok(mut frame) = Frame::unpack(outbound) {
                match frame.command() {
                    Ok(Command::Read) => {
                        frame.din = self.registers.get(&frame.addr).copied().unwrap_or(0);
                        return frame.pack().to_vec();
                    }
                    Ok(Command::Write) => {
                        self.registers.insert(frame.addr, frame.dout);
                        return frame.pack().to_vec();
                    }
                    Err(_) => (),
                }
            }
        }
        outbound.to_vec()
    }
}

impl Controller for Mock {
    fn transfer(&self, transfers: &mut [Transfer<'_>]) -> Result<usize, Status> {
        if let Some(gate) = &self.gate {
            gate.pass();
        }
        let mut state = lock(&self.state);
        state.history.push(
            transfers
                .iter()
                .map(|t| Record {
                    len: t.len(),
                    tx: t.tx_buf().map(<[u8]>::to_vec),
                    rx: t.is_rx(),
                    cs_change: t.cs_change,
                    bits_per_word: t.bits_per_word,
                    delay_usecs: t.delay_usecs,
                    speed_hz: t.speed_hz,
                })
                .collect(),
        );
        match state.fail {
            Some((0, code)) => {
                state.fail = None;
                return Err(code);
            }
            Some((ref mut n, _)) => *n -= 1,
            None => (),
        }
        let mut total = 0;
        for t in transfers.iter_mut() {
            let outbound = t.tx_buf().map_or_else(|| vec![0; t.len()], <[u8]>::to_vec);
            let inbound = state.respond(&outbound);
            if let Some(rx) = t.rx_buf() {
                rx.copy_from_slice(&inbound);
            }
            total += t.len();
        }
        Ok(total)
    }

    fn setup(&self, settings: &Settings) -> Result<(), Status> {
        let mut state = lock(&self.state);
        if let Some(code) = state.reject_setup {
            return Err(code);
        }
        if settings.bits_per_word > 32 {
            return Err(libc::EINVAL);
        }
        state.applied = Some(*settings);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use paste::paste;
    use spiframe::encode;

    fn run(mock: &Mock, transfers: &mut [Transfer<'_>]) -> usize {
        mock.transfer(transfers).unwrap()
    }

    #[test]
    fn test_write_frame() {
        let mock = Mock::new();
        let mut frame = encode(Command::Write, 0x10, 0xCAFE);
        run(&mock, &mut [Transfer::write(&mut frame)]);
        assert_eq!(mock.peek(0x10), Some(0xCAFE));
    }

    #[test]
    fn test_read_frame() {
        let mock = Mock::new();
        mock.poke(0x20, 0xDEAD_BEEF);
        let mut frame = encode(Command::Read, 0x20, 0);
        run(&mock, &mut [Transfer::duplex(&mut frame)]);
        assert_eq!(spiframe::decode(&frame), 0xDEAD_BEEF);
    }

    #[test]
    fn test_loopback() {
        let mock = Mock::new();
        let mut buf = [1u8, 2, 3];
        run(&mock, &mut [Transfer::duplex(&mut buf)]);
        assert_eq!(buf, [1, 2, 3]);
    }

    #[test]
    fn test_read_only_clocks_zeros() {
        let mock = Mock::new();
        let mut buf = [9u8; 4];
        run(&mock, &mut [Transfer::read(&mut buf)]);
        assert_eq!(buf, [0; 4]);
    }

    #[test]
    fn test_history() {
        let mock = Mock::new();
        let mut a = [1u8, 2];
        let mut b = [0u8; 3];
        run(
            &mock,
            &mut [
                Transfer::write(&mut a).cs_change(true),
                Transfer::read(&mut b).speed_hz(100),
            ],
        );
        let history = mock.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0][0].tx, Some(vec![1, 2]));
        assert!(history[0][0].cs_change);
        assert_eq!(history[0][1].tx, None);
        assert!(history[0][1].rx);
        assert_eq!(history[0][1].speed_hz, 100);
    }

    #[test]
    fn test_fail_next() {
        let mock = Mock::new();
        mock.fail_next(libc::EIO);
        let mut buf = [0u8; 1];
        assert_eq!(
            mock.transfer(&mut [Transfer::write(&mut buf)]),
            Err(libc::EIO)
        );
        assert_eq!(run(&mock, &mut [Transfer::write(&mut buf)]), 1);
    }

    #[test]
    fn test_fail_after() {
        let mock = Mock::new();
        mock.fail_after(2, libc::ETIMEDOUT);
        let mut buf = [0u8; 1];
        assert!(mock.transfer(&mut [Transfer::write(&mut buf)]).is_ok());
        assert!(mock.transfer(&mut [Transfer::write(&mut buf)]).is_ok());
        assert_eq!(
            mock.transfer(&mut [Transfer::write(&mut buf)]),
            Err(libc::ETIMEDOUT)
        );
        assert!(mock.transfer(&mut [Transfer::write(&mut buf)]).is_ok());
        assert_eq!(mock.transactions(), 4);
    }

    #[test]
    fn test_setup() {
        let mock = Mock::new();
        let settings = Settings {
            max_speed_hz: 1_000_000,
            ..Default::default()
        };
        mock.setup(&settings).unwrap();
        assert_eq!(mock.applied(), Some(settings));
        mock.reject_setup(Some(libc::EINVAL));
        assert_eq!(mock.setup(&Settings::default()), Err(libc::EINVAL));
        assert_eq!(mock.applied(), Some(settings));
    }

    macro_rules! test_rw_word {
        ($name:ident, $addr:literal, $v:literal) => {
            paste! {
                #[test]
                fn [<test_rw_ $name>]() {
                    let mock = Mock::new();
                    let mut w = encode(Command::Write, $addr, $v);
                    let mut r = encode(Command::Read, $addr, 0);
                    run(&mock, &mut [
                        Transfer::write(&mut w).cs_change(true),
                        Transfer::duplex(&mut r).cs_change(true),
                    ]);
                    assert_eq!(spiframe::decode(&r), $v);
                }
            }
        };
    }

    test_rw_word!(zero, 0x0, 0x0);
    test_rw_word!(scratchpad, 0x0001_0004, 0xDEAD_BEEF);
    test_rw_word!(top, 0x03FF_FFFC, 0xFFFF_FFFF);
}
