//! Build phases, their ordering and the typed phase bitmask.
//!
//! Phases form a strict linear order. Each phase maps to exactly one bit,
//! so "this phase and every lower one" is `bit | (bit - 1)`; [`PhaseMask`]
//! keeps that arithmetic behind a typed API.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use crate::errors::{BuildError, BuildResult};

/// Raw flag positioning a stage before the other stages of its phase.
pub const BEFORE_FLAG: u32 = 1 << 28;
/// Raw flag positioning a stage after the other stages of its phase.
pub const AFTER_FLAG: u32 = 1 << 29;
/// Raw flag reported when the pipeline failed.
pub const FAILED_FLAG: u32 = 1 << 30;
/// Raw flag reported when the pipeline walked past its last stage.
pub const FINISHED_FLAG: u32 = 1 << 31;

const BASE_BITS: u32 = (1 << Phase::ALL.len()) - 1;
const WHENCE_BITS: u32 = BEFORE_FLAG | AFTER_FLAG;

/// An ordered build milestone.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Prepare the build directory.
    Prepare,
    /// Download sources.
    Downloads,
    /// Build dependencies.
    Dependencies,
    /// Bootstrap the build system.
    Autogen,
    /// Configure the project.
    Configure,
    /// Compile the project.
    Build,
    /// Install build output.
    Install,
    /// Commit installed output.
    Commit,
    /// Export artifacts.
    Export,
    /// Final bookkeeping.
    Final,
}

impl Phase {
    /// Every phase in ascending order.
    pub const ALL: [Self; 10] = [
        Self::Prepare,
        Self::Downloads,
        Self::Dependencies,
        Self::Autogen,
        Self::Configure,
        Self::Build,
        Self::Install,
        Self::Commit,
        Self::Export,
        Self::Final,
    ];

    /// Position of the phase in the linear order.
    #[must_use]
    pub const fn rank(self) -> u32 {
        self as u32
    }

    /// The single bit this phase occupies in a [`PhaseMask`].
    #[must_use]
    pub const fn bit(self) -> u32 {
        1 << self.rank()
    }

    /// Looks up a phase by rank.
    #[must_use]
    pub fn from_rank(rank: u32) -> Option<Self> {
        Self::ALL.get(rank as usize).copied()
    }

    /// Decodes a single phase bit.
    #[must_use]
    pub fn from_bit(bit: u32) -> Option<Self> {
        if bit.count_ones() == 1 {
            Self::from_rank(bit.trailing_zeros())
        } else {
            None
        }
    }

    /// Short machine-readable name.
    #[must_use]
    pub const fn nick(self) -> &'static str {
        match self {
            Self::Prepare => "prepare",
            Self::Downloads => "downloads",
            Self::Dependencies => "dependencies",
            Self::Autogen => "autogen",
            Self::Configure => "configure",
            Self::Build => "build",
            Self::Install => "install",
            Self::Commit => "commit",
            Self::Export => "export",
            Self::Final => "final",
        }
    }

    /// Status word shown while the pipeline works on this phase.
    #[must_use]
    pub const fn progress_message(self) -> &'static str {
        match self {
            Self::Prepare => "Preparing",
            Self::Downloads => "Downloading",
            Self::Dependencies => "Building dependencies",
            Self::Autogen => "Bootstrapping",
            Self::Configure => "Configuring",
            Self::Build => "Building",
            Self::Install => "Installing",
            Self::Commit => "Committing",
            Self::Export => "Exporting",
            Self::Final => "Success",
        }
    }

    /// Parses a phase nick.
    #[must_use]
    pub fn from_nick(nick: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.nick() == nick)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.nick())
    }
}

/// Position of a stage relative to the others in its phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Whence {
    /// Runs before unmodified stages of the same phase.
    Before,
    /// No modifier.
    #[default]
    At,
    /// Runs after unmodified stages of the same phase.
    After,
}

impl Whence {
    /// Sort rank: `Before < At < After`.
    #[must_use]
    pub const fn rank(self) -> u32 {
        match self {
            Self::Before => 0,
            Self::At => 1,
            Self::After => 2,
        }
    }
}

/// A base phase plus its positioning modifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PhaseSpec {
    /// The base phase.
    pub phase: Phase,
    /// The modifier within the phase.
    #[serde(default)]
    pub whence: Whence,
}

impl PhaseSpec {
    /// Creates a spec with an explicit modifier.
    #[must_use]
    pub const fn new(phase: Phase, whence: Whence) -> Self {
        Self { phase, whence }
    }

    /// A stage that runs before the rest of `phase`.
    #[must_use]
    pub const fn before(phase: Phase) -> Self {
        Self::new(phase, Whence::Before)
    }

    /// A stage that runs after the rest of `phase`.
    #[must_use]
    pub const fn after(phase: Phase) -> Self {
        Self::new(phase, Whence::After)
    }

    /// The key the registry sorts on, ahead of priority.
    #[must_use]
    pub const fn sort_key(self) -> (u32, u32) {
        (self.phase.rank(), self.whence.rank())
    }

    /// Encodes into raw flags.
    #[must_use]
    pub const fn to_bits(self) -> u32 {
        let whence = match self.whence {
            Whence::Before => BEFORE_FLAG,
            Whence::At => 0,
            Whence::After => AFTER_FLAG,
        };
        self.phase.bit() | whence
    }

    /// Decodes raw flags.
    ///
    /// Exactly one base bit must be set, at most one modifier may be set and
    /// no unknown bits are allowed.
    pub fn from_bits(bits: u32) -> BuildResult<Self> {
        if bits & !(BASE_BITS | WHENCE_BITS) != 0 {
            return Err(BuildError::InvalidPhase(bits));
        }

        let phase = Phase::from_bit(bits & BASE_BITS).ok_or(BuildError::InvalidPhase(bits))?;
        let whence = match bits & WHENCE_BITS {
            0 => Whence::At,
            BEFORE_FLAG => Whence::Before,
            AFTER_FLAG => Whence::After,
            _ => return Err(BuildError::InvalidPhase(bits)),
        };

        Ok(Self { phase, whence })
    }
}

impl From<Phase> for PhaseSpec {
    fn from(phase: Phase) -> Self {
        Self::new(phase, Whence::At)
    }
}

impl TryFrom<u32> for PhaseSpec {
    type Error = BuildError;

    fn try_from(bits: u32) -> Result<Self, Self::Error> {
        Self::from_bits(bits)
    }
}

impl fmt::Display for PhaseSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.whence {
            Whence::Before => write!(f, "{}:before", self.phase),
            Whence::At => write!(f, "{}", self.phase),
            Whence::After => write!(f, "{}:after", self.phase),
        }
    }
}

/// A set of base phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PhaseMask(u32);

impl PhaseMask {
    /// No phases.
    pub const EMPTY: Self = Self(0);
    /// Every phase.
    pub const ALL: Self = Self(BASE_BITS);

    /// A mask holding only `phase`.
    #[must_use]
    pub const fn only(phase: Phase) -> Self {
        Self(phase.bit())
    }

    /// `phase` and every phase below it.
    #[must_use]
    pub const fn through(phase: Phase) -> Self {
        Self(phase.bit() | (phase.bit() - 1))
    }

    /// `phase` and every phase above it.
    #[must_use]
    pub const fn from_phase(phase: Phase) -> Self {
        Self(BASE_BITS & !(phase.bit() - 1))
    }

    /// Raw bits.
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Builds a mask from raw bits, ignoring modifier and unknown bits.
    #[must_use]
    pub const fn from_bits_truncate(bits: u32) -> Self {
        Self(bits & BASE_BITS)
    }

    /// Returns true when no phase is set.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Returns true when `phase` is in the mask.
    #[must_use]
    pub const fn contains(self, phase: Phase) -> bool {
        self.0 & phase.bit() != 0
    }

    /// Returns true when the masks share a phase.
    #[must_use]
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// Adds a phase.
    pub fn insert(&mut self, phase: Phase) {
        self.0 |= phase.bit();
    }

    /// The most significant phase in the mask.
    #[must_use]
    pub fn highest(self) -> Option<Phase> {
        if self.is_empty() {
            None
        } else {
            Phase::from_rank(31 - self.0.leading_zeros())
        }
    }

    /// The least significant phase in the mask.
    #[must_use]
    pub fn lowest(self) -> Option<Phase> {
        if self.is_empty() {
            None
        } else {
            Phase::from_rank(self.0.trailing_zeros())
        }
    }

    /// Iterates the phases in ascending order.
    pub fn iter(self) -> impl Iterator<Item = Phase> {
        Phase::ALL.into_iter().filter(move |p| self.contains(*p))
    }
}

impl From<Phase> for PhaseMask {
    fn from(phase: Phase) -> Self {
        Self::only(phase)
    }
}

impl BitOr for PhaseMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

impl BitOr<Phase> for PhaseMask {
    type Output = Self;

    fn bitor(self, rhs: Phase) -> Self::Output {
        Self(self.0 | rhs.bit())
    }
}

impl BitOrAssign for PhaseMask {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl FromIterator<Phase> for PhaseMask {
    fn from_iter<I: IntoIterator<Item = Phase>>(iter: I) -> Self {
        iter.into_iter().fold(Self::EMPTY, |mask, p| mask | p)
    }
}

/// The phase the pipeline reports to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(tag = "state", content = "phase", rename_all = "snake_case")]
pub enum PipelinePhase {
    /// Nothing has run yet.
    #[default]
    None,
    /// Working on a phase.
    Active(Phase),
    /// The last task failed.
    Failed,
    /// The walk passed the last stage.
    Finished,
}

impl PipelinePhase {
    /// Raw flag value of this state.
    #[must_use]
    pub const fn to_bits(self) -> u32 {
        match self {
            Self::None => 0,
            Self::Active(phase) => phase.bit(),
            Self::Failed => FAILED_FLAG,
            Self::Finished => FINISHED_FLAG,
        }
    }

    /// Status word for this state.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::None => "Ready",
            Self::Active(phase) => phase.progress_message(),
            Self::Failed => "Failed",
            Self::Finished => "Success",
        }
    }
}
