//! Parsers and helpers for the Linux `/proc` filesystem.

pub mod parser;

pub use parser::{
    CpuTopology, MemInfo, ParseError, PasswdEntry, PidStat, PidStatus, UserResolver,
    parse_cpuinfo, parse_meminfo, parse_passwd, parse_pid_stat, parse_pid_status, parse_smaps_pss,
};

/// Clock ticks per second (USER_HZ). Standard value for Linux.
pub const CLK_TCK: u64 = 100;
