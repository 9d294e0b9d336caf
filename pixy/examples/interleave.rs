//! Two fibers taking turns, then sleeping out the clock.
//!
//! ```text
//! $ cargo run --example interleave
//! A - 1
//! B - 1
//! A - 2
//! B - 2
//! A - 3
//! B - 3
//! Wait 2 seconds...
//! Wait 2 seconds...
//! Done!
//! Done!
//! ```

use std::process;
use std::time::Duration;

fn chatter(who: char) {
    for i in 1..=3 {
        println!("{} - {}", who, i);
        pixy::fiber::reschedule();
    }
    println!("Wait 2 seconds...");
    pixy::fiber::sleep(Duration::from_secs(2));
    println!("Done!");
}

fn main() {
    process::exit(pixy::run(|| {
        pixy::fiber::start(|| chatter('A'));
        pixy::fiber::start(|| chatter('B'));
        0
    }));
}
