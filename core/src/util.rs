/// Emit a pipeline trace line on stderr. Tracing is off unless the
/// `BASECODE_DEBUG` environment variable is set to `true`, and the whole
/// check disappears from release builds, so sessions pay nothing for it in
/// normal use. The driver uses this to narrate phase boundaries
/// (elaboration totals, the assembly listing) without touching the
/// diagnostic stream.
///
/// Example:
/// ```
/// basecode::debug!("resolved {} references", 3);
/// ```
#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => {
        #[cfg(debug_assertions)]
        {
            let enabled = std::env::var("BASECODE_DEBUG")
                .map(|value| value.eq_ignore_ascii_case("true"))
                .unwrap_or(false);
            if enabled {
                eprintln!($($arg)*);
            }
        }
    };
}
