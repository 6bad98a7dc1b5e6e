//! Debugging aids that dump the allocator's internal state to a text
//! stream.  Descended from the original source's `dump_flist()` and
//! `dump_buckets()`; production callers must not depend on the exact
//! format.
use std::io::{self, Write};

use crate::small_pool;

/// Writes one line per live bucket: its size class, region base
/// address, and the number of currently allocated slots.
pub fn dump_buckets<W: Write>(out: &mut W) -> io::Result<()> {
    for (class, region, live_slots, total_slots) in small_pool::describe_buckets() {
        writeln!(
            out,
            "class={} region={:#x} live={}/{}",
            class, region, live_slots, total_slots
        )?;
    }
    Ok(())
}

#[no_mangle]
pub extern "C" fn slotter_dump_buckets() {
    let stdout = io::stdout();
    let mut handle = stdout.lock();
    let _ = dump_buckets(&mut handle);
}
