//! Lock / PIN entry state machine
//!
//! ```text
//!            lock()                    digit (buffer shorter than PIN)
//! Unlocked ─────────► Locked ──digit──► EnteringCode ◄──┐
//!    ▲                  ▲                   │  │        │
//!    │                  └── wrong code ─────┘  └────────┘
//!    └──────────────── code matches ───────────┘
//!
//! any state ── remove() ──► Removed (terminal)
//! ```
//!
//! `EnteringCode` only changes what the lock screen shows; both it and
//! `Locked` block normal dispatch.

/// Lock state of one surface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Unlocked,
    Locked,
    /// Locked with a partial code entered
    EnteringCode,
    /// Panel gone, nothing changes any more
    Removed,
}

/// Result of a key press fed into the lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinOutcome {
    /// Not locked, or the key is not a digit
    Ignored,
    /// Digit appended; holds the entry length
    Digit(usize),
    /// Code matched
    Unlocked,
    /// Wrong code of full length, entry cleared
    Cleared,
}

#[derive(Debug, Clone)]
pub struct PinLock {
    state: LockState,
    entry: String,
}

impl PinLock {
    pub fn new(locked: bool) -> Self {
        Self {
            state: if locked {
                LockState::Locked
            } else {
                LockState::Unlocked
            },
            entry: String::new(),
        }
    }

    pub fn state(&self) -> LockState {
        self.state
    }

    pub fn is_locked(&self) -> bool {
        matches!(self.state, LockState::Locked | LockState::EnteringCode)
    }

    pub fn is_removed(&self) -> bool {
        self.state == LockState::Removed
    }

    /// Digits entered so far
    pub fn entry(&self) -> &str {
        &self.entry
    }

    /// Lock, discarding any partial entry. Returns true if the state changed.
    pub fn lock(&mut self) -> bool {
        match self.state {
            LockState::Unlocked => {
                self.state = LockState::Locked;
                self.entry.clear();
                true
            }
            LockState::EnteringCode => {
                self.state = LockState::Locked;
                self.entry.clear();
                false
            }
            LockState::Locked | LockState::Removed => false,
        }
    }

    /// Unlock without a code. Returns true if the state changed.
    pub fn unlock(&mut self) -> bool {
        if !self.is_locked() {
            return false;
        }
        self.state = LockState::Unlocked;
        self.entry.clear();
        true
    }

    pub fn remove(&mut self) {
        self.state = LockState::Removed;
        self.entry.clear();
    }

    /// Feed a press into the lock
    ///
    /// # Arguments
    /// * `digit` - Digit under the pressed key, None for keys off the keypad
    /// * `pin` - Configured code
    pub fn press(&mut self, digit: Option<u8>, pin: &str) -> PinOutcome {
        if !self.is_locked() {
            return PinOutcome::Ignored;
        }
        let Some(digit) = digit.filter(|d| *d <= 9) else {
            return PinOutcome::Ignored;
        };

        self.entry.push(char::from(b'0' + digit));
        if self.entry == pin {
            self.state = LockState::Unlocked;
            self.entry.clear();
            PinOutcome::Unlocked
        } else if self.entry.len() >= pin.len() {
            self.state = LockState::Locked;
            self.entry.clear();
            PinOutcome::Cleared
        } else {
            self.state = LockState::EnteringCode;
            PinOutcome::Digit(self.entry.len())
        }
    }
}
