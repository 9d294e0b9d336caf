//! Producer/consumer over a rendezvous mailbox; `None` closes the stream.

use std::process;
use std::rc::Rc;

use pixy::fiber::Mailbox;

fn main() {
    process::exit(pixy::run(|| {
        let mailbox: Rc<Mailbox<Option<i32>>> = Rc::new(Mailbox::new());

        let mb = Rc::clone(&mailbox);
        pixy::fiber::start(move || loop {
            let mail = mb.get();
            match mail.take() {
                Some(i) => println!("{}", i),
                None => break,
            }
        });

        for i in 1..=5 {
            mailbox.put(Some(i));
        }
        mailbox.put(None);
        0
    }));
}
