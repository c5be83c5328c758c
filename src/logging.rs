//! Log output for the sync core.
//!
//! Everything in this crate logs through the [`cvlog!`] macro, which stamps
//! each line with the wall-clock time and the source location:
//!
//! ```text
//! 2026-08-30T09:12:45.000Z src/session.rs:210 refresh: 3 friend(s), 1 pending
//! ```
//!
//! Lines go to stderr unless [`set_writer`] has installed another sink (a
//! file, an in-memory buffer in tests, a logcat bridge on the head unit).
//! When stderr is a terminal the stamp is dimmed and user ids are tinted
//! with a colour derived from the id itself, so one friend stays one colour
//! across a whole log tail.  A custom writer always gets plain text.

use std::io::{self, IsTerminal, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{LazyLock, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

static TINT: AtomicBool = AtomicBool::new(false);

static SINK: LazyLock<Mutex<Box<dyn Write + Send>>> =
    LazyLock::new(|| Mutex::new(Box::new(io::stderr())));

/// Call once at startup.  Enables colour when stderr is a terminal.
pub fn init() {
    TINT.store(io::stderr().is_terminal(), Ordering::Relaxed);
}

/// Redirect all subsequent [`cvlog!`] output to `sink`, plain text only.
pub fn set_writer(sink: Box<dyn Write + Send>) {
    TINT.store(false, Ordering::Relaxed);
    *SINK.lock().unwrap() = sink;
}

fn tinted() -> bool {
    TINT.load(Ordering::Relaxed)
}

// SGR codes: 90+ are the bright variants, 31..=36 the plain ones.  White
// and black are skipped so ids stay readable on either background.
const ID_TINTS: [u8; 12] = [91, 92, 93, 94, 95, 96, 31, 32, 33, 34, 35, 36];

/// Short display form of a user id: `u-` plus the first eight characters,
/// tinted deterministically when colour is on.
pub fn user_id(id: &str) -> String {
    let cut = id.char_indices().nth(8).map_or(id.len(), |(i, _)| i);
    let short = &id[..cut];
    if tinted() {
        let mut h = 0usize;
        for b in id.bytes() {
            h = h.wrapping_mul(131).wrapping_add(b as usize);
        }
        let code = ID_TINTS[h % ID_TINTS.len()];
        format!("\x1b[{code}mu-{short}\x1b[0m")
    } else {
        format!("u-{short}")
    }
}

/// Days since the epoch to a civil (year, month, day).
fn civil_date(days: i64) -> (i64, u64, u64) {
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = yoe as i64 + era * 400 + i64::from(month <= 2);
    (year, month, day)
}

/// Current wall-clock time as `YYYY-MM-DDTHH:MM:SS.mmmZ`.
///
/// Doubles as the `last_location_updated` stamp written to profile rows.
pub fn format_timestamp() -> String {
    let elapsed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let secs = elapsed.as_secs();
    let (year, month, day) = civil_date((secs / 86_400) as i64);
    let (hh, mm, ss) = (secs / 3600 % 24, secs / 60 % 60, secs % 60);
    format!(
        "{year:04}-{month:02}-{day:02}T{hh:02}:{mm:02}:{ss:02}.{:03}Z",
        elapsed.subsec_millis()
    )
}

/// Write one line to the current sink.  Backs the [`cvlog!`] macro; not
/// meant to be called directly.
pub fn emit(file: &str, line: u32, msg: &str) {
    let stamp = format_timestamp();
    let mut sink = SINK.lock().unwrap();
    let _ = if tinted() {
        writeln!(*sink, "\x1b[2m{stamp} {file}:{line}\x1b[0m {msg}")
    } else {
        writeln!(*sink, "{stamp} {file}:{line} {msg}")
    };
}

/// Log a formatted line with timestamp and source location.
///
/// ```ignore
/// cvlog!("rebuild: {} friend location(s)", locations.len());
/// cvlog!("realtime: update from {}", logging::user_id(&id));
/// ```
#[macro_export]
macro_rules! cvlog {
    ($($arg:tt)*) => {{
        $crate::logging::emit(file!(), line!(), &format!($($arg)*));
    }};
}
