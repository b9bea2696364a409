//! env_logger setup. Filtering follows `RUST_LOG`, defaulting to info.

use std::io::Write;

use env_logger::{Builder, Env};

/// Install the global logger. Safe to call more than once; later
/// calls are ignored.
pub fn init()
{   let _ = Builder::from_env(Env::default().default_filter_or("info"))
      .format(|buf, record| {
        writeln!(
          buf,
          "{} {:<5} {} {}",
          buf.timestamp_millis(),
          record.level(),
          record.target(),
          record.args()
        )
      })
      .try_init();
}

/// Logger for tests: output is captured per test.
pub fn init_for_tests()
{   let _ = Builder::from_env(Env::default().default_filter_or("debug"))
      .is_test(true)
      .try_init();
}
