//! Shared test environment: flat little-endian RAM plus call logs, with a
//! handle the test keeps to adjust budgets and inspect effects while the
//! JIT owns the environment.

use std::sync::Arc;

use parking_lot::Mutex;

use armature_engine::{Environment, ExceptionKind};

#[derive(Default)]
pub struct Shared {
    pub mem: Vec<u8>,
    pub ticks: u64,
    pub ticks_consumed: u64,
    pub svc_calls: Vec<u32>,
    pub exceptions: Vec<(u64, ExceptionKind)>,
    pub interpreter_calls: Vec<(u64, usize)>,
    pub reads: Vec<u64>,
    pub writes: Vec<(u64, u64)>,
}

impl Shared {
    pub fn read(&self, vaddr: u64, size: usize) -> u64 {
        let mut value = 0u64;
        for i in 0..size {
            let byte = self
                .mem
                .get(vaddr as usize + i)
                .copied()
                .unwrap_or(0);
            value |= (byte as u64) << (8 * i);
        }
        value
    }

    pub fn write(&mut self, vaddr: u64, value: u64, size: usize) {
        for i in 0..size {
            let idx = vaddr as usize + i;
            if idx < self.mem.len() {
                self.mem[idx] = (value >> (8 * i)) as u8;
            }
        }
    }

    pub fn load_words(&mut self, base: u64, words: &[u32]) {
        for (i, w) in words.iter().enumerate() {
            self.write(base + 4 * i as u64, *w as u64, 4);
        }
    }

    pub fn load_halfwords(&mut self, base: u64, halves: &[u16]) {
        for (i, h) in halves.iter().enumerate() {
            self.write(base + 2 * i as u64, *h as u64, 2);
        }
    }
}

pub struct TestEnv {
    pub shared: Arc<Mutex<Shared>>,
}

pub fn test_env(mem_size: usize) -> (TestEnv, Arc<Mutex<Shared>>) {
    let shared = Arc::new(Mutex::new(Shared {
        mem: vec![0; mem_size],
        ticks: 100,
        ..Default::default()
    }));
    (
        TestEnv {
            shared: shared.clone(),
        },
        shared,
    )
}

impl Environment for TestEnv {
    fn read_memory8(&mut self, vaddr: u64) -> u8 {
        let mut s = self.shared.lock();
        s.reads.push(vaddr);
        s.read(vaddr, 1) as u8
    }

    fn read_memory16(&mut self, vaddr: u64) -> u16 {
        let mut s = self.shared.lock();
        s.reads.push(vaddr);
        s.read(vaddr, 2) as u16
    }

    fn read_memory32(&mut self, vaddr: u64) -> u32 {
        let mut s = self.shared.lock();
        s.reads.push(vaddr);
        s.read(vaddr, 4) as u32
    }

    fn read_memory64(&mut self, vaddr: u64) -> u64 {
        let mut s = self.shared.lock();
        s.reads.push(vaddr);
        s.read(vaddr, 8)
    }

    fn write_memory8(&mut self, vaddr: u64, value: u8) {
        let mut s = self.shared.lock();
        s.writes.push((vaddr, value as u64));
        s.write(vaddr, value as u64, 1);
    }

    fn write_memory16(&mut self, vaddr: u64, value: u16) {
        let mut s = self.shared.lock();
        s.writes.push((vaddr, value as u64));
        s.write(vaddr, value as u64, 2);
    }

    fn write_memory32(&mut self, vaddr: u64, value: u32) {
        let mut s = self.shared.lock();
        s.writes.push((vaddr, value as u64));
        s.write(vaddr, value as u64, 4);
    }

    fn write_memory64(&mut self, vaddr: u64, value: u64) {
        let mut s = self.shared.lock();
        s.writes.push((vaddr, value));
        s.write(vaddr, value, 8);
    }

    fn interpreter_fallback(&mut self, pc: u64, num_instructions: usize) {
        self.shared.lock().interpreter_calls.push((pc, num_instructions));
    }

    fn call_svc(&mut self, swi: u32) {
        self.shared.lock().svc_calls.push(swi);
    }

    fn exception_raised(&mut self, pc: u64, kind: ExceptionKind) {
        self.shared.lock().exceptions.push((pc, kind));
    }

    fn add_ticks(&mut self, ticks: u64) {
        self.shared.lock().ticks_consumed += ticks;
    }

    fn ticks_remaining(&mut self) -> u64 {
        self.shared.lock().ticks
    }
}
