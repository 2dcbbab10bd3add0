//! Owns a [`Cpu`] and a [`Memory`], and drives the step loop.
//!
//! Everything here is policy layered on top of `cpu`/`memory`/`execute`:
//! the parcel-fetch protocol, wiring the shared machine timer into both the
//! CSR file and the MMIO bus, optional debug-mode invariant checks, and a
//! register/function trace for diagnostics. None of it is architecturally
//! required — an embedder could drive `Cpu`/`Memory` directly — but it is
//! the ambient harness every non-trivial embedding needs.

use crate::bus::Peripheral;
use crate::cpu::{Cpu, EcallHook};
use crate::error::{InvariantViolationError, MachineError, SetupError, StepError};
use crate::memory::{Memory, RamInit};
use crate::registers::Specifier;
use crate::resources::clint::{Clint, TimerState};
use log::trace;
use std::collections::BTreeMap;

/// How the general-purpose registers are initialized at reset. `x0` is
/// always zero regardless of this setting.
#[derive(Debug, Clone)]
pub enum RegisterInit {
    Zero,
    Random,
    /// Broadcasts a literal value to `x1`–`x31`.
    Literal(u32),
}

impl Default for RegisterInit {
    fn default() -> Self {
        Self::Zero
    }
}

/// Construction-time configuration for a [`Machine`]. Plain data; an
/// embedder fills in what it needs and takes the rest from [`Default`].
#[derive(Debug, Clone)]
pub struct Config {
    pub register_init: RegisterInit,
    pub ram_init: RamInit,
    /// Base address RAM is mapped at.
    pub ram_base: u32,
    /// Size of RAM in bytes.
    pub ram_size: u32,
    /// Whether the C extension is enabled at reset.
    pub rvc_enabled: bool,
    /// Whether the step loop ticks the machine timer after each instruction.
    pub timer_enabled: bool,
    /// Whether [`Machine::step`] runs the debug invariant checks and
    /// function-entry trace before each fetch.
    pub debug_invariants: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            register_init: RegisterInit::default(),
            ram_init: RamInit::default(),
            ram_base: 0x8000_0000,
            ram_size: 0,
            rvc_enabled: true,
            timer_enabled: true,
            debug_invariants: false,
        }
    }
}

/// A single RV32IMAC hart plus its memory, wired together into a runnable
/// machine.
pub struct Machine {
    cpu: Cpu,
    memory: Memory,
    timer_enabled: bool,
    debug_invariants: bool,
    instructions_retired: u64,
    stack_top: Option<u32>,
    stack_bottom: Option<u32>,
    heap_end: Option<u32>,
    text_range: Option<(u32, u32)>,
    text_snapshot: Option<Vec<u8>>,
    function_symbols: BTreeMap<u32, String>,
}

impl std::fmt::Debug for Machine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Machine")
            .field("cpu", &self.cpu)
            .field("instructions_retired", &self.instructions_retired)
            .finish_non_exhaustive()
    }
}

impl Machine {
    /// Builds a machine from `config`, with the hart's `pc` set to
    /// `entry_pc`. Registers the machine timer's MMIO surface; any other
    /// peripheral is the embedder's responsibility via
    /// [`Self::register_peripheral`].
    pub fn new(config: &Config, entry_pc: u32) -> Result<Self, SetupError> {
        if config.ram_size == 0 {
            return Err(SetupError::InvalidRamSize(0));
        }
        if config.ram_base.checked_add(config.ram_size).is_none() {
            return Err(SetupError::InvalidBaseAddress(config.ram_base, config.ram_size));
        }
        let mut memory = Memory::with_init(config.ram_base, config.ram_size, config.ram_init.clone());

        let timer = TimerState::new_handle();
        memory.register_peripheral(Box::new(Clint::new(timer.clone())));
        memory.register_peripheral(Box::new(Clint::mtime_half(timer.clone())));

        let mut cpu = Cpu::new(entry_pc, timer);
        cpu.set_misa_c(config.rvc_enabled);
        apply_register_init(&mut cpu, &config.register_init);

        Ok(Self {
            cpu,
            memory,
            timer_enabled: config.timer_enabled,
            debug_invariants: config.debug_invariants,
            instructions_retired: 0,
            stack_top: None,
            stack_bottom: None,
            heap_end: None,
            text_range: None,
            text_snapshot: None,
            function_symbols: BTreeMap::new(),
        })
    }

    pub fn cpu(&self) -> &Cpu {
        &self.cpu
    }

    pub fn cpu_mut(&mut self) -> &mut Cpu {
        &mut self.cpu
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut Memory {
        &mut self.memory
    }

    pub fn instructions_retired(&self) -> u64 {
        self.instructions_retired
    }

    /// Registers a peripheral discovered at runtime (e.g. a host-backed
    /// UART chosen by the embedder's CLI), surfacing an overlap as a
    /// recoverable [`SetupError`] instead of panicking.
    pub fn register_peripheral(&mut self, peripheral: Box<dyn Peripheral>) -> Result<(), SetupError> {
        self.memory.try_register_peripheral(peripheral)
    }

    /// Installs the ECALL hook invoked when `mtvec == 0`. See
    /// [`crate::cpu::Cpu::install_ecall_hook`].
    pub fn install_ecall_hook(&mut self, hook: Box<EcallHook>) {
        self.cpu.install_ecall_hook(hook);
    }

    pub fn assert_external_interrupt(&mut self) {
        self.cpu.assert_external_interrupt();
    }

    pub fn clear_external_interrupt(&mut self) {
        self.cpu.clear_external_interrupt();
    }

    /// Records the ELF-derived boundaries the debug invariant checks
    /// validate `sp` against. Leave unset (the default) to skip those
    /// checks.
    pub fn set_stack_bounds(&mut self, stack_bottom: u32, stack_top: u32) {
        self.stack_bottom = Some(stack_bottom);
        self.stack_top = Some(stack_top);
    }

    /// Records the current heap end, as tracked by an external `sbrk`
    /// handler, for the heap/stack collision check.
    pub fn set_heap_end(&mut self, heap_end: u32) {
        self.heap_end = Some(heap_end);
    }

    /// Records a function-symbol map (address -> name) used by the
    /// function-entry trace.
    pub fn set_function_symbols(&mut self, symbols: BTreeMap<u32, String>) {
        self.function_symbols = symbols;
    }

    /// Snapshots `[addr, addr+len)` for later `.text` tamper detection.
    pub fn snapshot_text(&mut self, addr: u32, len: u32) -> Result<(), StepError> {
        let bytes = self.memory.snapshot(addr, len)?;
        self.text_range = Some((addr, len));
        self.text_snapshot = Some(bytes);
        Ok(())
    }

    /// Renders every `x` register plus `pc`, one per line, for diagnostic
    /// dumps (e.g. on fatal error).
    pub fn format_registers(&self) -> String {
        let mut out = String::new();
        for specifier in Specifier::iter_all() {
            out.push_str(&format!("{specifier} = {:#010x}\n", self.cpu.x(specifier)));
        }
        out.push_str(&format!("pc = {:#010x}\n", self.cpu.pc()));
        out
    }

    fn trace_function_entry(&self) {
        if let Some(name) = self.function_symbols.get(&self.cpu.pc()) {
            trace!("entering {name} at {:#010x}", self.cpu.pc());
        }
    }

    /// Runs the debug-mode invariant checks. No-op (returns `Ok`) unless
    /// `debug_invariants` is set — callers that want the checks
    /// unconditionally can call this directly instead of going through
    /// [`Self::step`].
    pub fn check_invariants(&self) -> Result<(), InvariantViolationError> {
        if self.cpu.x(Specifier::X0) != 0 {
            return Err(InvariantViolationError::ZeroRegisterNonZero);
        }

        let pc = self.cpu.pc();
        let base = self.memory.base_addr();
        let size = self.memory.size();
        if pc < base || pc - base >= size {
            return Err(InvariantViolationError::PcOutOfBounds { pc, size });
        }

        let gp = self.cpu.x(Specifier::from_u5(3));
        if gp != 0 {
            let sp = self.cpu.x(Specifier::SP);
            if let Some(stack_top) = self.stack_top {
                if sp > stack_top {
                    return Err(InvariantViolationError::StackOverflow { sp, stack_top });
                }
            }
            if let Some(stack_bottom) = self.stack_bottom {
                if sp < stack_bottom {
                    return Err(InvariantViolationError::StackUnderflow { sp, stack_bottom });
                }
            }
        }

        if let (Some(heap_end), Some(stack_bottom)) = (self.heap_end, self.stack_bottom) {
            if heap_end % 4 != 0 {
                return Err(InvariantViolationError::HeapMisaligned(heap_end));
            }
            if heap_end.saturating_add(256) > stack_bottom {
                return Err(InvariantViolationError::HeapStackCollision { heap_end, stack_bottom });
            }
        }

        if let (Some((addr, len)), Some(snapshot)) = (self.text_range, &self.text_snapshot) {
            let current = self
                .memory
                .snapshot(addr, len)
                .expect("previously snapshotted range must still be in bounds");
            if let Some(offset) = current
                .iter()
                .zip(snapshot.iter())
                .position(|(a, b)| a != b)
            {
                return Err(InvariantViolationError::TextTampered { offset: offset as u32 });
            }
        }

        Ok(())
    }

    /// Executes one instruction: optional debug checks, the parcel-fetch
    /// protocol, dispatch, timer tick, peripheral ticks, then the `pc`
    /// commit.
    pub fn step(&mut self) -> Result<(), MachineError> {
        if self.debug_invariants {
            self.check_invariants()?;
            self.trace_function_entry();
        }

        let pc = self.cpu.pc();
        let inst_low = self
            .memory
            .load_half(pc, false)
            .map_err(|e| MachineError::Step(StepError::from(e)))?;

        if inst_low & 0x3 == 0x3 {
            let inst_high = self
                .memory
                .load_half(pc.wrapping_add(2), false)
                .map_err(|e| MachineError::Step(StepError::from(e)))?;
            let inst = (inst_high << 16) | inst_low;
            self.cpu.execute_32(&mut self.memory, inst)?;
        } else {
            self.cpu.execute_16(&mut self.memory, inst_low as u16)?;
        }

        if self.timer_enabled {
            self.cpu
                .timer_tick()
                .map_err(|e| MachineError::Step(StepError::from(e)))?;
        }
        self.memory.tick_peripherals();
        self.cpu.commit_pc();
        self.instructions_retired += 1;
        Ok(())
    }

    /// Runs [`Self::step`] until it returns an error (including a clean
    /// `Exited` termination) or `max_steps` instructions have retired,
    /// whichever comes first.
    pub fn run(&mut self, max_steps: Option<u64>) -> Result<(), MachineError> {
        loop {
            if let Some(max) = max_steps {
                if self.instructions_retired >= max {
                    return Ok(());
                }
            }
            self.step()?;
        }
    }
}

fn apply_register_init(cpu: &mut Cpu, init: &RegisterInit) {
    let value = match init {
        RegisterInit::Zero => return,
        RegisterInit::Random => {
            for specifier in Specifier::iter_all().skip(1) {
                cpu.set_x(specifier, rand::random());
            }
            return;
        }
        RegisterInit::Literal(v) => *v,
    };
    for specifier in Specifier::iter_all().skip(1) {
        cpu.set_x(specifier, value);
    }
}
