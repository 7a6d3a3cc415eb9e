//! An in-memory line-echo server in immediate-mode style.
//!
//! Each simulated client sends one line, a few bytes per wake-up; the state
//! machine reads until the newline, then echoes the line back. The poll
//! function is straight-line code: accept, stage the readable queue, stage
//! the writable queue, retire finished conversations. Wake-ups travel as
//! encoded references through an mpsc channel standing in for an OS event
//! multiplexer.
//!
//! Run with: cargo run --example echo --features std

use imsm::{Ctx, Driver, Entry, EntryFirst, StateMachine, typed};
use std::alloc::{Layout, alloc_zeroed};
use std::collections::VecDeque;
use std::sync::mpsc;
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

const MAX_CONNS: usize = 32;
const BUF_SIZE: usize = 120;
/// Bytes the simulated peer hands over per wake-up.
const CHUNK: usize = 8;

#[repr(C)]
struct EchoState {
    header: Entry,
    client: usize,
    in_len: u8,
    line_len: u8,
    buf: [u8; BUF_SIZE],
}

unsafe impl EntryFirst for EchoState {}

struct Client {
    /// Bytes the peer will eventually send.
    input: Vec<u8>,
    /// Prefix of `input` made available so far.
    delivered: usize,
    /// Prefix the state machine has consumed.
    consumed: usize,
    /// Bytes echoed back to the peer.
    echoed: Vec<u8>,
    /// Cookie parked waiting for more input, if any.
    parked: Option<u64>,
    closed: bool,
}

struct Sim {
    clients: Vec<Client>,
    accept_queue: VecDeque<usize>,
}

static SIM: Mutex<Sim> = Mutex::new(Sim {
    clients: Vec::new(),
    accept_queue: VecDeque::new(),
});
static WAKE_TX: OnceLock<mpsc::Sender<u64>> = OnceLock::new();

enum IoResult {
    Done,
    Retry,
}

fn close_client(state: *mut u8) {
    let state = state.cast::<EchoState>();
    let client = unsafe { (*state).client };
    let mut sim = SIM.lock().unwrap();
    if let Some(c) = sim.clients.get_mut(client) {
        c.closed = true;
        c.parked = None;
    }
}

/// Accepts up to `batch_limit` pending clients as fresh state machines.
fn accept_new_connections(ctx: &mut Ctx, batch_limit: usize) -> typed::TypedList<EchoState> {
    let accepted = typed::list_get::<EchoState>(ctx, batch_limit);
    let mut sim = SIM.lock().unwrap();

    for _ in 0..batch_limit {
        let Some(&client) = sim.accept_queue.front() else {
            break;
        };
        let state: *mut EchoState = typed::get(ctx);
        if state.is_null() {
            // Arena exhausted: leave the client queued, try next frame.
            break;
        }

        sim.accept_queue.pop_front();
        unsafe {
            (*state).client = client;
            (*state).in_len = 0;
            (*state).line_len = 0;
        }
        assert!(accepted.push(state, 0));
    }

    accepted
}

/// Copies whatever the peer has delivered; done once a newline (or a full
/// buffer) is in hand.
fn read_step(state: *mut EchoState) -> IoResult {
    let mut sim = SIM.lock().unwrap();
    let client = &mut sim.clients[unsafe { (*state).client }];

    while client.consumed < client.delivered {
        let in_len = unsafe { (*state).in_len } as usize;
        if in_len >= BUF_SIZE {
            unsafe { (*state).line_len = BUF_SIZE as u8 };
            return IoResult::Done;
        }

        let byte = client.input[client.consumed];
        client.consumed += 1;
        unsafe {
            (*state).buf[in_len] = byte;
            (*state).in_len = (in_len + 1) as u8;
        }
        if byte == b'\n' {
            unsafe { (*state).line_len = (in_len + 1) as u8 };
            return IoResult::Done;
        }
    }

    IoResult::Retry
}

/// Echoes the finished line back to the peer in one go.
fn write_step(state: *mut EchoState) -> IoResult {
    let mut sim = SIM.lock().unwrap();
    let line_len = unsafe { (*state).line_len } as usize;
    let client = &mut sim.clients[unsafe { (*state).client }];
    client
        .echoed
        .extend_from_slice(unsafe { &(&(*state).buf)[..line_len] });
    IoResult::Done
}

/// Parks `state` until the peer delivers more bytes.
fn park(ctx: &Ctx, state: *mut EchoState) {
    let r = ctx.refer(state.cast());
    assert!(!r.is_null());
    let mut sim = SIM.lock().unwrap();
    sim.clients[unsafe { (*state).client }].parked = Some(r.bits());
}

fn drive_stage(
    ctx: &mut Ctx,
    staged: typed::TypedList<EchoState>,
    step: fn(*mut EchoState) -> IoResult,
) -> typed::TypedList<EchoState> {
    let done = typed::list_get::<EchoState>(ctx, staged.size());
    for state in staged.iter() {
        match step(state) {
            IoResult::Done => {
                assert!(done.push(state, 0));
            }
            IoResult::Retry => park(ctx, state),
        }
    }
    done
}

fn echo_poll(ctx: &mut Ctx) {
    let accepted = accept_new_connections(ctx, MAX_CONNS);

    let fully_read = ctx.with_region(imsm::point_record!("read_first_line"), |ctx| {
        let readable = typed::stage_io(ctx, imsm::point_record!("ready_to_read"), accepted, 0);
        drive_stage(ctx, readable, read_step)
    });

    let echoed = ctx.with_region(imsm::point_record!("echo_line"), |ctx| {
        let writable = typed::stage_io(ctx, imsm::point_record!("ready_to_write"), fully_read, 0);
        drive_stage(ctx, writable, write_step)
    });

    let n = echoed.size();
    unsafe { typed::put_n(ctx, echoed, n) };
}

/// The "kernel" side: trickle bytes to parked conversations and wake them.
fn deliver_pending_bytes() {
    let tx = WAKE_TX.get().expect("wake channel installed at start-up");
    let mut sim = SIM.lock().unwrap();
    for client in sim.clients.iter_mut() {
        if client.closed || client.delivered >= client.input.len() {
            continue;
        }
        client.delivered = (client.delivered + CHUNK).min(client.input.len());
        if let Some(bits) = client.parked.take() {
            tx.send(bits).expect("driver alive");
        }
    }
}

fn main() {
    let lines = [
        "immediate mode: redraw everything, every frame\n",
        "state lives in the arena, not on a stack\n",
        "a queue is just a program point\n",
        "spurious wake-ups are fine; use-after-free is not\n",
    ];

    {
        let mut sim = SIM.lock().unwrap();
        for (i, line) in lines.iter().enumerate() {
            sim.clients.push(Client {
                input: line.as_bytes().to_vec(),
                delivered: 0,
                consumed: 0,
                echoed: Vec::new(),
                parked: None,
                closed: false,
            });
            sim.accept_queue.push_back(i);
        }
    }

    let (tx, mut rx) = mpsc::channel::<u64>();
    WAKE_TX.set(tx).expect("single main");

    let layout = Layout::array::<EchoState>(MAX_CONNS).unwrap();
    let arena = unsafe { alloc_zeroed(layout) }.cast::<EchoState>();
    assert!(!arena.is_null());

    let machine: &'static mut StateMachine<EchoState> =
        Box::leak(Box::new(StateMachine::new()));
    unsafe { machine.init(arena, MAX_CONNS, None, Some(close_client), echo_poll) };
    let mut driver = unsafe { Driver::new(machine.raw()) };

    let mut frames = 0;
    loop {
        deliver_pending_bytes();
        driver.frame(&mut rx, Duration::from_millis(1));
        frames += 1;

        let sim = SIM.lock().unwrap();
        if sim.clients.iter().all(|c| c.closed) {
            break;
        }
        assert!(frames < 1_000, "echo pipeline failed to converge");
    }

    let sim = SIM.lock().unwrap();
    for (client, line) in sim.clients.iter().zip(&lines) {
        assert_eq!(client.echoed, line.as_bytes());
        print!("echoed after {frames} frames: {}", line);
    }
}
