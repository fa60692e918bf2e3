// src/main.rs
// Demo: timers, a producer/consumer pair, and a readiness-driven socket
// read, all on one thread.
use std::io::{Read, Write};
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::task::Poll;
use std::time::Duration;

use weave::{
    chan, defer, dprintfn, repeat, run, spawn, task, Channel, Cx, FnTimer, RecvOp, Repeat,
    SendOp, Task, TaskPoll,
};

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

struct Producer {
    ch: Channel<String>,
    items: Vec<&'static str>,
    next: usize,
    op: Option<SendOp<String>>,
}

impl Task for Producer {
    fn poll(&mut self, cx: &mut Cx<'_>) -> TaskPoll {
        loop {
            if let Some(op) = self.op.as_mut() {
                match op.poll(cx) {
                    Poll::Pending => return TaskPoll::Pending,
                    Poll::Ready(Ok(())) => self.op = None,
                    Poll::Ready(Err(_)) => {
                        dprintfn!("producer: peer closed the channel");
                        return TaskPoll::Ready;
                    }
                }
            }
            if self.next == self.items.len() {
                self.ch.close();
                dprintfn!("producer: done, channel closed");
                return TaskPoll::Ready;
            }
            let item = self.items[self.next];
            self.next += 1;
            self.op = Some(self.ch.send(item.to_string()));
        }
    }
}

struct Consumer {
    ch: Channel<String>,
    op: Option<RecvOp<String>>,
}

impl Task for Consumer {
    fn poll(&mut self, cx: &mut Cx<'_>) -> TaskPoll {
        loop {
            let op = self.op.get_or_insert_with(|| self.ch.recv());
            match op.poll(cx) {
                Poll::Pending => return TaskPoll::Pending,
                Poll::Ready(Some(v)) => {
                    dprintfn!("consumer: got {v}");
                    self.op = None;
                }
                Poll::Ready(None) => {
                    dprintfn!("consumer: channel drained");
                    return TaskPoll::Ready;
                }
            }
        }
    }
}

struct SocketRead {
    sock: UnixStream,
    armed: bool,
}

impl Task for SocketRead {
    fn poll(&mut self, cx: &mut Cx<'_>) -> TaskPoll {
        if !self.armed {
            cx.stream_read(self.sock.as_raw_fd());
            self.armed = true;
            return TaskPoll::Pending;
        }
        let mut buf = [0u8; 64];
        match self.sock.read(&mut buf) {
            Ok(n) => dprintfn!("socket: read {:?}", String::from_utf8_lossy(&buf[..n])),
            Err(e) => dprintfn!("socket: read failed: {e}"),
        }
        TaskPoll::Ready
    }
}

fn main() {
    dprintfn!("boot");

    // Two one-shot timers, out of order on purpose.
    defer(ms(200), task!(|_cx| {
        dprintfn!("A");
        TaskPoll::Ready
    }));
    defer(ms(100), task!(|_cx| {
        dprintfn!("B");
        TaskPoll::Ready
    }));

    // A recurrent timer that stops itself after three rounds.
    let mut rounds = 0u32;
    repeat(
        ms(50),
        FnTimer(move |cx: &mut Cx<'_>| {
            rounds += 1;
            dprintfn!("tick {rounds} at {}ms", cx.elapsed().as_millis());
            if rounds < 3 {
                Repeat::Again
            } else {
                Repeat::Stop
            }
        }),
    );

    // Rendezvous fan between a producer and a consumer.
    let ch = chan::<String>(0);
    spawn("producer", Producer { ch: ch.clone(), items: vec!["p1", "p2", "p3"], next: 0, op: None });
    spawn("consumer", Consumer { ch, op: None });

    // A socket that becomes readable 30 ms in.
    let (mut tx, rx) = UnixStream::pair().expect("socketpair");
    spawn("socket-read", SocketRead { sock: rx, armed: false });
    defer(ms(30), task!(|_cx| {
        if let Err(e) = tx.write_all(b"ping") {
            dprintfn!("socket: write failed: {e}");
        }
        TaskPoll::Ready
    }));

    run();
    dprintfn!("quiescent");
}
