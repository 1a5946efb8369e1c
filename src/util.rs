/* SPDX-License-Identifier: GPL-3.0-or-later */
/*! Misc utilities */

/** Like `format!`, but prepends file and line number.
 *
 * Example: `tag!("Failed to X: {} {}", arg1, arg2)` */
#[macro_export]
macro_rules! tag {
    ($x:tt) => {
        format!(concat!(std::file!(), ":", std::line!(), ": ", $x))
    };
    ($x:tt, $($arg:tt)+) => {
        format!(concat!(std::file!(), ":", std::line!(), ": ", $x), $($arg)+)
    };
}

/** Wall-clock milliseconds since the Unix epoch; used to stamp outgoing
 * disconnect messages. Zero if the clock is before the epoch. */
pub fn timestamp_millis() -> u64 {
    match std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH) {
        Ok(t) => t.as_millis() as u64,
        Err(_) => 0,
    }
}
