//! Per-driver log gating on top of the `log` facade.
//!
//! Every driver resolves its own `*_LOG` level once at construction and
//! passes it to these macros, so the global logger can stay permissive.

macro_rules! ll_log {
    ($ll:expr, $lvl:expr, $($arg:tt)+) => {
        if $lvl <= $ll {
            log::log!($lvl, $($arg)+);
        }
    };
}

macro_rules! ll_trace {
    ($ll:expr, $($arg:tt)+) => { ll_log!($ll, log::Level::Trace, $($arg)+) };
}

macro_rules! ll_debug {
    ($ll:expr, $($arg:tt)+) => { ll_log!($ll, log::Level::Debug, $($arg)+) };
}

macro_rules! ll_info {
    ($ll:expr, $($arg:tt)+) => { ll_log!($ll, log::Level::Info, $($arg)+) };
}

macro_rules! ll_warn {
    ($ll:expr, $($arg:tt)+) => { ll_log!($ll, log::Level::Warn, $($arg)+) };
}

macro_rules! ll_error {
    ($ll:expr, $($arg:tt)+) => { ll_log!($ll, log::Level::Error, $($arg)+) };
}
