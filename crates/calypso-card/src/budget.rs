//! Session modification budget
//!
//! A card limits how much it may modify inside one secure session: revision 1
//! and 2.4 cards count modifying commands, revision 3 cards count bytes of
//! their session buffer. The byte cost of a command and the buffer size are
//! card formulas kept behind [`session_buffer_cost`] and
//! [`buffer_size_from_indicator`].

use crate::error::SessionError;

/// Fixed session-buffer overhead charged per modifying command
const SESSION_BUFFER_COMMAND_OVERHEAD: usize = 6;

/// Buffer size (bytes) indexed by the startup-info buffer size indicator
const BUFFER_SIZE_BY_INDICATOR: [usize; 56] = [
    0, 0, 0, 0, 0, 0, 215, 256, 304, 362, 430, 512, 608, 724, 861, 1024, 1217, 1448, 1722, 2048,
    2435, 2896, 3444, 4096, 4870, 5792, 6888, 8192, 9741, 11585, 13777, 16384, 19483, 23170,
    27554, 32768, 38967, 46340, 55108, 65536, 77935, 92681, 110217, 131072, 155871, 185363,
    220435, 262144, 311743, 370727, 440871, 524288, 623487, 741455, 881743, 1048576,
];

/// Unit in which the session modification counter is expressed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BudgetUnit {
    Bytes,
    Commands,
}

/// Session buffer size for a buffer size indicator (0 when out of table)
pub fn buffer_size_from_indicator(indicator: u8) -> usize {
    BUFFER_SIZE_BY_INDICATOR
        .get(indicator as usize)
        .copied()
        .unwrap_or(0)
}

/// Session-buffer bytes consumed by a modifying command with `data_length` bytes of data
pub fn session_buffer_cost(data_length: usize) -> usize {
    data_length + SESSION_BUFFER_COMMAND_OVERHEAD
}

/// Running consumption of the session modification budget
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModificationBudget {
    unit: BudgetUnit,
    max: usize,
    used: usize,
}

impl ModificationBudget {
    pub fn new(unit: BudgetUnit, max: usize) -> Self {
        Self { unit, max, used: 0 }
    }

    pub fn unit(&self) -> BudgetUnit {
        self.unit
    }

    pub fn max(&self) -> usize {
        self.max
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn remaining(&self) -> usize {
        self.max.saturating_sub(self.used)
    }

    /// Units a command with `data_length` bytes of data consumes
    pub fn cost_of(&self, data_length: usize) -> usize {
        match self.unit {
            BudgetUnit::Commands => 1,
            BudgetUnit::Bytes => session_buffer_cost(data_length),
        }
    }

    /// Whether the next command would exceed the cap
    pub fn would_overflow(&self, data_length: usize) -> bool {
        self.used + self.cost_of(data_length) > self.max
    }

    /// Account for a modifying command that was sent
    pub fn record(&mut self, data_length: usize) {
        self.used = self.used.saturating_add(self.cost_of(data_length));
    }

    /// Check then account; fails without recording when the command does not fit
    pub fn try_record(&mut self, data_length: usize) -> Result<(), SessionError> {
        if self.would_overflow(data_length) {
            return Err(SessionError::ModificationBufferOverflow {
                required: self.cost_of(data_length),
                remaining: self.remaining(),
            });
        }
        self.record(data_length);
        Ok(())
    }

    pub fn reset(&mut self) {
        self.used = 0;
    }
}
