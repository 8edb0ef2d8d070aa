//! Run and control task codes.
//!
//! A *run task* is a long-lived DSP acquisition (histogram or list-mode); a
//! *control task* is a short DSP routine triggered through the ControlTask
//! variable and polled to completion through the CSR.

use dpm_hw::Word;

/// Long-running DSP acquisitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RunTask {
    Idle = 0,
    ListMode = 0x100,
    Histogram = 0x301,
}

impl RunTask {
    pub fn from_raw(raw: Word) -> Self {
        match raw {
            0x100 => Self::ListMode,
            0x301 => Self::Histogram,
            _ => Self::Idle,
        }
    }
}

/// Short DSP-hosted routines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ControlTask {
    Idle = 0,
    SetDacs = 1,
    EnableInput = 2,
    RampOffsetDacs = 3,
    GetTraces = 4,
    ProgramFippi = 5,
    GetBaselines = 6,
    AdjustOffsets = 7,
    TauFinder = 8,
}

impl ControlTask {
    pub fn from_raw(raw: Word) -> Self {
        match raw {
            1 => Self::SetDacs,
            2 => Self::EnableInput,
            3 => Self::RampOffsetDacs,
            4 => Self::GetTraces,
            5 => Self::ProgramFippi,
            6 => Self::GetBaselines,
            7 => Self::AdjustOffsets,
            8 => Self::TauFinder,
            _ => Self::Idle,
        }
    }
}

/// How a run starts: fresh or resuming the previous accumulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunMode {
    #[default]
    New,
    Resume,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_round_trip() {
        assert_eq!(RunTask::from_raw(RunTask::ListMode as Word), RunTask::ListMode);
        assert_eq!(RunTask::from_raw(0xdead), RunTask::Idle);
        assert_eq!(
            ControlTask::from_raw(ControlTask::GetTraces as Word),
            ControlTask::GetTraces
        );
    }
}
