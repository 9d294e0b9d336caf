//! A writer fiber feeding a reader fiber through a pipe, one greeting per
//! second; the reader exits cleanly when the write end closes.

use std::process;
use std::time::Duration;

use pixy::coio;

fn main() {
    process::exit(pixy::run(|| {
        let (rd, wr) = coio::pipe2(0).expect("pipe2");

        pixy::fiber::start(move || {
            let mut buf = [0u8; 100];
            loop {
                let n = coio::read(rd, &mut buf, None).expect("read");
                if n == 0 {
                    break;
                }
                let text = buf[..n].split(|&b| b == 0).next().unwrap();
                println!("{}", String::from_utf8_lossy(text));
            }
            coio::close(rd).expect("close");
        });

        pixy::fiber::start(move || {
            for _ in 0..5 {
                coio::write(wr, b"Hello!\0", None).expect("write");
                pixy::fiber::sleep(Duration::from_secs(1));
            }
            coio::close(wr).expect("close");
        });

        0
    }));
}
