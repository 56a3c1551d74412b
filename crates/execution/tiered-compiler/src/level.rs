//! 编译层级
//!
//! ```text
//! none (0)              解释执行，可选剖析
//! simple (1)            剖析编译器，不剖析
//! limited_profile (2)   剖析编译器，仅调用与回边计数
//! full_profile (3)      剖析编译器，完整剖析
//! full_optimization (4) 优化编译器
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

/// Bci of a whole-method compile; any other value is an OSR entry.
pub const INVOCATION_ENTRY_BCI: i32 = -1;

/// Optimization level. Totally ordered.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[repr(i8)]
pub enum CompLevel {
    #[default]
    None = 0,
    Simple = 1,
    LimitedProfile = 2,
    FullProfile = 3,
    FullOptimization = 4,
}

impl CompLevel {
    pub const ALL: [CompLevel; 5] = [
        CompLevel::None,
        CompLevel::Simple,
        CompLevel::LimitedProfile,
        CompLevel::FullProfile,
        CompLevel::FullOptimization,
    ];

    pub fn from_i8(level: i8) -> Option<CompLevel> {
        match level {
            0 => Some(CompLevel::None),
            1 => Some(CompLevel::Simple),
            2 => Some(CompLevel::LimitedProfile),
            3 => Some(CompLevel::FullProfile),
            4 => Some(CompLevel::FullOptimization),
            _ => None,
        }
    }

    pub fn as_i8(self) -> i8 {
        self as i8
    }

    /// Levels produced by the profiling compiler.
    pub fn is_c1_compile(self) -> bool {
        matches!(
            self,
            CompLevel::Simple | CompLevel::LimitedProfile | CompLevel::FullProfile
        )
    }

    pub fn is_c2_compile(self) -> bool {
        self == CompLevel::FullOptimization
    }

    /// Any level that requires a compiler.
    pub fn is_compile(self) -> bool {
        self != CompLevel::None
    }

    /// Compiler that produces code at this level.
    pub fn compiler(self) -> Option<CompilerKind> {
        match self {
            CompLevel::None => None,
            CompLevel::FullOptimization => Some(CompilerKind::Optimizing),
            _ => Some(CompilerKind::Profiling),
        }
    }
}

impl fmt::Display for CompLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CompLevel::None => "none",
            CompLevel::Simple => "simple",
            CompLevel::LimitedProfile => "limited_profile",
            CompLevel::FullProfile => "full_profile",
            CompLevel::FullOptimization => "full_optimization",
        };
        f.write_str(name)
    }
}

/// The two compiler capabilities the policy schedules work for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompilerKind {
    /// Fast compiler producing levels 1-3.
    Profiling,
    /// Slow compiler producing level 4.
    Optimizing,
}

impl CompilerKind {
    pub const ALL: [CompilerKind; 2] = [CompilerKind::Profiling, CompilerKind::Optimizing];

    /// Representative level used for queue and thread-count queries.
    pub fn level(self) -> CompLevel {
        match self {
            CompilerKind::Profiling => CompLevel::FullProfile,
            CompilerKind::Optimizing => CompLevel::FullOptimization,
        }
    }
}

impl fmt::Display for CompilerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompilerKind::Profiling => f.write_str("profiling"),
            CompilerKind::Optimizing => f.write_str("optimizing"),
        }
    }
}

/// Which compilers are in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompilationMode {
    /// Both compilers, all five levels.
    #[default]
    Tiered,
    /// Profiling compiler only; every target is clamped to `simple`.
    QuickOnly,
    /// Optimizing compiler only; profiling happens in the interpreter.
    HighOnly,
    /// No compilation at all.
    InterpreterOnly,
}

impl CompilationMode {
    /// Levels 1-3 are unavailable.
    pub fn disable_intermediate(self) -> bool {
        self == CompilationMode::HighOnly
    }

    pub fn quick_only(self) -> bool {
        self == CompilationMode::QuickOnly
    }

    pub fn uses(self, kind: CompilerKind) -> bool {
        match self {
            CompilationMode::Tiered => true,
            CompilationMode::QuickOnly => kind == CompilerKind::Profiling,
            CompilationMode::HighOnly => kind == CompilerKind::Optimizing,
            CompilationMode::InterpreterOnly => false,
        }
    }

    /// Highest level this mode can produce.
    pub fn highest_level(self) -> CompLevel {
        match self {
            CompilationMode::Tiered | CompilationMode::HighOnly => CompLevel::FullOptimization,
            CompilationMode::QuickOnly => CompLevel::Simple,
            CompilationMode::InterpreterOnly => CompLevel::None,
        }
    }

    /// Whether `level` can be produced in this mode.
    pub fn is_valid_level(self, level: CompLevel) -> bool {
        match self {
            CompilationMode::Tiered => true,
            CompilationMode::QuickOnly => level <= CompLevel::Simple,
            CompilationMode::HighOnly => {
                level == CompLevel::None || level == CompLevel::FullOptimization
            }
            CompilationMode::InterpreterOnly => level == CompLevel::None,
        }
    }
}
