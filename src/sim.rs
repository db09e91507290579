//! Simulating and execution for SIC/XE programs.
//!
//! This module is focused on executing linked object programs (i.e., [`ObjectProgram`]).
//!
//! This module consists of:
//! - [`Simulator`]: The struct that simulates assembled code.
//! - [`mem`]: The module handling memory and the registers.
//! - [`load`]: The module handling loading and linking object programs.
//! - [`decode`]: The module handling decoding instructions out of memory.
//! - [`device`]: The module handling external devices (`TD`, `RD`, `WD`).
//! - [`debug`]: The module handling types of breakpoints for the simulator.
//!
//! # Usage
//!
//! To simulate some code, you need to instantiate a Simulator and load an object program into it:
//!
//! ```
//! use sicxe_ensemble::asm::assemble;
//! use sicxe_ensemble::ast::{InstrTable, Reg};
//! use sicxe_ensemble::sim::Simulator;
//!
//! let src = "\
//! SUM      START   1000
//!          LDA     #3
//!          SUB     ONE
//!          STA     RESULT
//!          RSUB
//! ONE      WORD    1
//! RESULT   RESW    1
//!          END
//! ";
//! let obj = assemble(src, &InstrTable::sicxe()).unwrap();
//!
//! let mut sim = Simulator::new(Default::default());
//! sim.load(&obj).unwrap();
//! sim.run().unwrap();
//!
//! assert_eq!(sim.reg(Reg::A), 2);
//! assert_eq!(sim.read_word(0x100F).unwrap(), 2);
//! ```
//!
//! The program ends once it jumps past the end of memory.
//! The linkage register starts out pointing there (see [`SimFlags::initial_linkage`]),
//! so a top-level `RSUB` ends the program.
//!
//! ## Execution
//!
//! Beyond the basic [`Simulator::run`] (which runs until the program ends),
//! there are also:
//! - [`Simulator::step`]: manual step-by-step simulation
//! - [`Simulator::run_while`], [`Simulator::run_with_limit`]: more advanced programmatic execution
//!
//! Breakpoints (see [`debug::Breakpoint`]) pause all execution functions except [`Simulator::step`].
//!
//! ## Devices
//!
//! `TD`, `RD`, and `WD` access devices through the simulator's [`DeviceHandler`].
//! The most useful device for programmatic uses is [`device::BufferedDevice`],
//! which exposes its input and output as shared buffers.
//!
//! ```
//! use sicxe_ensemble::asm::assemble;
//! use sicxe_ensemble::ast::InstrTable;
//! use sicxe_ensemble::sim::Simulator;
//! use sicxe_ensemble::sim::device::BufferedDevice;
//!
//! let src = "\
//! ECHO     START   0
//! LOOP     TD      DEV
//!          JEQ     LOOP
//!          RD      DEV
//!          WD      DEV
//!          J       LOOP
//! DEV      BYTE    X'F1'
//!          END
//! ";
//! let obj = assemble(src, &InstrTable::sicxe()).unwrap();
//!
//! let mut sim = Simulator::new(Default::default());
//! sim.load(&obj).unwrap();
//!
//! let dev = BufferedDevice::new();
//! dev.input().write().unwrap().extend(b"SIC");
//! sim.attach_device(0xF1, dev.clone());
//!
//! sim.run_with_limit(15).unwrap();
//! assert_eq!(&*dev.output().read().unwrap(), b"SIC");
//! ```
pub mod mem;
pub mod load;
pub mod decode;
pub mod device;
pub mod debug;

use std::collections::{HashMap, HashSet};
use std::ops::Range;
use std::path::Path;

use crate::asm::encoding::{ObjectProgram, RecordErr};
use crate::ast::{InstrTable, Reg};
use debug::Breakpoint;
use device::{ActiveDevice, Device, DeviceHandler};

use self::decode::{decode, DecodedInstruction, Operands};
use self::load::LoadedProgram;
use self::mem::{signed, ConditionCode, Mem, RegFile, FILLER, MEM_SIZE, WORD_MASK};

/// Errors that can occur during loading and simulation.
#[derive(Debug)]
pub enum SimErr {
    /// The object program text could not be read.
    MalformedRecord(RecordErr),
    /// A modification record named a symbol that no section defines.
    UnresolvedSymbol(String),
    /// Memory was accessed past its end.
    AddressOutOfRange(u32),
    /// `RD` or `WD` was used on a device that is not the active device.
    DeviceNotActive(u8),
    /// A format 2 instruction named a register that does not exist.
    BadRegister(u8),
    /// The simulator was stepped without a loaded program,
    /// or the object program had no sections.
    NoProgram,
    /// An unknown opcode was executed while [`SimFlags::halt_on_unknown_opcode`] was set.
    UnknownOpcode {
        /// The address of the instruction.
        addr: u32,
        /// The first byte of the instruction.
        byte: u8
    },
    /// The object program file could not be read.
    Io(std::io::Error),
}
impl std::fmt::Display for SimErr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SimErr::MalformedRecord(e)          => write!(f, "could not read object program: {e}"),
            SimErr::UnresolvedSymbol(s)         => write!(f, "unresolved external symbol {s}"),
            SimErr::AddressOutOfRange(a)        => write!(f, "address {a:06X} is out of range"),
            SimErr::DeviceNotActive(d)          => write!(f, "device {d:02X} is not active"),
            SimErr::BadRegister(r)              => write!(f, "invalid register number {r}"),
            SimErr::NoProgram                   => f.write_str("no program is loaded"),
            SimErr::UnknownOpcode { addr, byte } => write!(f, "unknown opcode {byte:02X} at {addr:06X}"),
            SimErr::Io(e)                       => write!(f, "could not read object program: {e}"),
        }
    }
}
impl std::error::Error for SimErr {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SimErr::MalformedRecord(e) => Some(e),
            SimErr::Io(e) => Some(e),
            _ => None
        }
    }
}
impl crate::err::Error for SimErr {
    fn help(&self) -> Option<std::borrow::Cow<str>> {
        match self {
            SimErr::MalformedRecord(e)  => crate::err::Error::help(e),
            SimErr::UnresolvedSymbol(s) => Some(format!("add {s} to the EXTDEF of the section that defines it").into()),
            SimErr::AddressOutOfRange(_) => Some(format!("memory ends at {:06X}", MEM_SIZE - 1).into()),
            SimErr::DeviceNotActive(_)  => Some("test the device with TD before reading or writing it".into()),
            SimErr::BadRegister(_)      => None,
            SimErr::NoProgram           => Some("load an object program before running".into()),
            SimErr::UnknownOpcode { .. } => None,
            SimErr::Io(_)               => None,
        }
    }
}
impl From<RecordErr> for SimErr {
    fn from(value: RecordErr) -> Self {
        SimErr::MalformedRecord(value)
    }
}

macro_rules! sim_opcodes {
    ($Type:ident, {$($name:ident = $value:literal),+ $(,)?}) => {
        #[derive(Debug, PartialEq, Eq, Clone, Copy)]
        #[allow(clippy::upper_case_acronyms)]
        enum $Type {
            $($name = $value),+
        }
        impl $Type {
            fn mnemonic(self) -> &'static str {
                match self {
                    $(Self::$name => stringify!($name)),+
                }
            }
        }
        impl TryFrom<u8> for $Type {
            type Error = u8;

            fn try_from(value: u8) -> Result<Self, Self::Error> {
                match value {
                    $($value => Ok(Self::$name)),+,
                    v => Err(v)
                }
            }
        }
    }
}
sim_opcodes!(SimInstr, {
    LDA   = 0x00,
    STA   = 0x0C,
    STX   = 0x10,
    STL   = 0x14,
    SUB   = 0x1C,
    COMP  = 0x28,
    JEQ   = 0x30,
    JLT   = 0x38,
    J     = 0x3C,
    JSUB  = 0x48,
    RSUB  = 0x4C,
    LDCH  = 0x50,
    STCH  = 0x54,
    LDT   = 0x74,
    COMPR = 0xA0,
    CLEAR = 0xB4,
    TIXR  = 0xB8,
    RD    = 0xD8,
    WD    = 0xDC,
    TD    = 0xE0,
});

/// The outcome of a single [`Simulator::step`].
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum StepEvent {
    /// An instruction was executed.
    Executed {
        /// The address of the instruction.
        addr: u32,
        /// The instruction's mnemonic.
        mnemonic: &'static str
    },
    /// The instruction is known, but the simulator does not execute it.
    /// It was skipped over.
    Unsupported {
        /// The address of the instruction.
        addr: u32,
        /// The instruction's mnemonic.
        mnemonic: String
    },
    /// The byte at the PC is not a known opcode. The PC moved forward by one byte.
    UnknownOpcode {
        /// The address of the byte.
        addr: u32,
        /// The byte.
        byte: u8
    },
    /// There is nothing left to execute.
    Finished,
}

/// Reason for why execution paused if it wasn't due to an error.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
enum PauseCondition {
    /// Program ran off the end of memory.
    Finished,
    /// Program hit a breakpoint.
    Breakpoint,
    /// Program hit a tripwire condition.
    Tripwire,
    /// Program hit an error and did not pause successfully.
    #[default]
    Unsuccessful
}

/// Configuration flags for [`Simulator`].
///
/// These can be modified after the `Simulator` is created with [`Simulator::new`]
/// and their effects should still apply.
///
/// Read the field descriptions for more details.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct SimFlags {
    /// The value of the linkage register `L` when a program is loaded.
    ///
    /// Returning through this value ends the program when it points past the end of memory.
    ///
    /// By default, this is [`MEM_SIZE`].
    pub initial_linkage: u32,

    /// Whether an unknown opcode stops the simulator with [`SimErr::UnknownOpcode`].
    ///
    /// If false, unknown opcodes are reported (as [`StepEvent::UnknownOpcode`]) and skipped.
    ///
    /// By default, this flag is `false`.
    pub halt_on_unknown_opcode: bool,

    /// Whether to log every executed instruction (at the `TRACE` level).
    ///
    /// By default, this flag is `true`.
    pub trace_instructions: bool,
}
impl Default for SimFlags {
    fn default() -> Self {
        Self {
            initial_linkage: MEM_SIZE,
            halt_on_unknown_opcode: false,
            trace_instructions: true,
        }
    }
}

/// Executes linked object programs.
#[derive(Debug)]
pub struct Simulator {
    // ------------------ SIMULATION STATE ------------------
    // Calling [`Simulator::reset`] resets these values.

    /// The simulator's memory.
    mem: Mem,
    /// The simulator's register file (including the PC).
    reg_file: RegFile,
    /// The condition code, unset until the first comparison.
    cc: Option<ConditionCode>,
    /// The loaded program.
    program: Option<LoadedProgram>,
    /// The PC each section last left off at.
    section_pcs: HashMap<String, u32>,
    /// The target address of the last instruction (if it had one).
    target_address: Option<u32>,
    /// The bytes of the last instruction.
    last_object_code: Vec<u8>,
    /// The mnemonic of the last instruction.
    last_instruction: Option<String>,
    /// The address of the last instruction.
    last_addr: Option<u32>,
    /// The number of instructions run since the program was loaded.
    instructions_run: u64,
    /// Indicates the reason why the last execution (via [`Simulator::run_while`] and adjacent)
    /// had paused.
    pause_condition: PauseCondition,

    // ------------------ CONFIG/DEBUG STATE ------------------
    // Calling [`Simulator::reset`] does not reset these values.

    /// The instruction set used to decode.
    table: InstrTable,

    /// Configuration settings for the simulator.
    ///
    /// These are preserved between resets.
    ///
    /// See [`SimFlags`] for more details on what configuration
    /// settings are available.
    pub flags: SimFlags,

    /// Breakpoints for the simulator.
    breakpoints: HashSet<Breakpoint>,

    /// All external devices connected to the system.
    device_handler: DeviceHandler,
}
impl Simulator where Simulator: Send + Sync {}

impl Simulator {
    /// Creates a new simulator (for the full SIC/XE instruction set), without a loaded program.
    pub fn new(flags: SimFlags) -> Self {
        Self::with_table(flags, InstrTable::sicxe())
    }

    /// Creates a new simulator which decodes with the given instruction table.
    pub fn with_table(flags: SimFlags, table: InstrTable) -> Self {
        Self {
            mem: Mem::new(),
            reg_file: RegFile::new(),
            cc: None,
            program: None,
            section_pcs: HashMap::new(),
            target_address: None,
            last_object_code: vec![],
            last_instruction: None,
            last_addr: None,
            instructions_run: 0,
            pause_condition: Default::default(),

            table,
            flags,
            breakpoints: Default::default(),
            device_handler: Default::default(),
        }
    }

    /// Resets the simulator.
    ///
    /// This unloads the program and clears memory and registers,
    /// while preserving configuration and debug state.
    ///
    /// Note that this function preserves:
    /// - Flags
    /// - The instruction table
    /// - Breakpoints
    /// - Devices (however, they are reset)
    pub fn reset(&mut self) {
        let table = std::mem::replace(&mut self.table, InstrTable::empty());
        let breakpoints = std::mem::take(&mut self.breakpoints);
        let dev_handler = std::mem::take(&mut self.device_handler);

        *self = Simulator::with_table(self.flags, table);
        self.breakpoints = breakpoints;
        self.device_handler = dev_handler;
        self.device_handler.reset();
    }

    /// Loads and links an object program into this simulator.
    ///
    /// Anything previously in memory is cleared, the PC is set to the program's entry point,
    /// and `L` is set to [`SimFlags::initial_linkage`].
    pub fn load(&mut self, obj: &ObjectProgram) -> Result<(), SimErr> {
        self.mem.clear();
        self.reg_file = RegFile::new();
        self.cc = None;
        self.program = None;
        self.section_pcs.clear();
        self.target_address = None;
        self.last_object_code.clear();
        self.last_instruction = None;
        self.last_addr = None;
        self.instructions_run = 0;
        self.device_handler.deactivate();

        let program = load::load(obj, &mut self.mem)?;
        tracing::debug!(name = program.name(), entry = program.entry, length = program.length(), "loaded program");

        self.reg_file.set(Reg::PC, program.entry);
        self.reg_file.set(Reg::L, self.flags.initial_linkage);
        self.program = Some(program);
        Ok(())
    }
    /// Parses object program text, then loads it into this simulator.
    pub fn load_str(&mut self, text: &str) -> Result<(), SimErr> {
        let obj = text.parse::<ObjectProgram>()?;
        self.load(&obj)
    }
    /// Reads an object program file, then loads it into this simulator.
    pub fn load_file(&mut self, path: impl AsRef<Path>) -> Result<(), SimErr> {
        let text = std::fs::read_to_string(path).map_err(SimErr::Io)?;
        self.load_str(&text)
    }

    // ------------------ QUERIES ------------------

    /// The value of a register.
    pub fn reg(&self, reg: Reg) -> u32 {
        self.reg_file[reg]
    }
    /// The program counter.
    pub fn pc(&self) -> u32 {
        self.reg_file[Reg::PC]
    }
    /// The condition code, if a comparison has happened yet.
    pub fn cc(&self) -> Option<ConditionCode> {
        self.cc
    }
    /// The target address of the last executed instruction.
    ///
    /// For immediate operands, this is the operand's value.
    pub fn target_address(&self) -> Option<u32> {
        self.target_address
    }
    /// The device which is currently active, if any.
    pub fn active_device(&self) -> Option<ActiveDevice> {
        self.device_handler.active()
    }
    /// Whether the device numbered at `addr` is currently active.
    pub fn is_device_active(&self, addr: u32) -> bool {
        self.device_handler.is_active(addr)
    }
    /// Whether the device numbered at `addr` was activated at some point.
    pub fn was_device_activated(&self, addr: u32) -> bool {
        self.device_handler.was_activated(addr)
    }
    /// The PC the given section last left off at.
    pub fn section_pc(&self, name: &str) -> Option<u32> {
        self.section_pcs.get(name).copied()
    }
    /// The name of the section the PC is in.
    pub fn current_section(&self) -> Option<&str> {
        let pc = self.pc();
        self.program.as_ref()?
            .section_at(pc)
            .map(|s| &*s.name)
    }
    /// The loaded program, if there is one.
    pub fn program(&self) -> Option<&LoadedProgram> {
        self.program.as_ref()
    }
    /// The name of the loaded program.
    pub fn program_name(&self) -> Option<&str> {
        self.program.as_ref().map(LoadedProgram::name)
    }
    /// The total length of the loaded program.
    pub fn program_length(&self) -> Option<u32> {
        self.program.as_ref().map(LoadedProgram::length)
    }
    /// The address the loaded program starts at.
    pub fn program_start(&self) -> Option<u32> {
        self.program.as_ref().map(LoadedProgram::start)
    }
    /// The address of the first instruction of the loaded program.
    pub fn entry_point(&self) -> Option<u32> {
        self.program.as_ref().map(|p| p.entry)
    }
    /// The object code of the last instruction, in hex.
    pub fn last_object_code(&self) -> String {
        self.last_object_code.iter()
            .map(|b| format!("{b:02X}"))
            .collect()
    }
    /// The mnemonic of the last instruction.
    pub fn last_instruction_name(&self) -> Option<&str> {
        self.last_instruction.as_deref()
    }
    /// The address of the last instruction (or unknown opcode) stepped over.
    pub fn last_instruction_addr(&self) -> Option<u32> {
        self.last_addr
    }
    /// The mnemonic of the instruction the next step would run.
    ///
    /// Like [`Simulator::step`], this skips filler bytes at the PC.
    /// This is `None` if there is no instruction left, or its opcode is not in the table.
    pub fn next_instruction_name(&self) -> Option<&str> {
        let addr = (self.pc()..MEM_SIZE).find(|&a| self.mem.get_byte(a).is_ok_and(|b| b != FILLER))?;
        let instr = decode(addr, &self.mem, &self.table).ok()??;
        self.table.lookup_opcode(instr.opcode).map(|i| &*i.mnemonic)
    }
    /// The number of instructions run since the program was loaded.
    pub fn instructions_run(&self) -> u64 {
        self.instructions_run
    }
    /// Reads a byte of memory.
    pub fn read_byte(&self, addr: u32) -> Result<u8, SimErr> {
        self.mem.get_byte(addr)
    }
    /// Reads a word of memory.
    pub fn read_word(&self, addr: u32) -> Result<u32, SimErr> {
        self.mem.get_word(addr)
    }
    /// Gets a reference to the memory.
    pub fn mem(&self) -> &Mem {
        &self.mem
    }

    /// Creates a hex dump of the given memory range.
    ///
    /// Each line holds an address and up to 16 bytes.
    ///
    /// ```
    /// use sicxe_ensemble::sim::Simulator;
    ///
    /// let mut sim = Simulator::new(Default::default());
    /// sim.load_str("HA     000010000003\nT00001003454F46\nE000010\n").unwrap();
    ///
    /// assert_eq!(sim.dump(0x10..0x14).unwrap(), "000010 45 4F 46 FF\n");
    /// ```
    pub fn dump(&self, range: Range<u32>) -> Result<String, SimErr> {
        use std::fmt::Write;

        let len = range.end.saturating_sub(range.start);
        let bytes = self.mem.get_bytes(range.start, len)?;

        let mut buf = String::new();
        for (i, line) in bytes.chunks(16).enumerate() {
            let addr = range.start + 16 * i as u32;
            let hex: Vec<_> = line.iter().map(|b| format!("{b:02X}")).collect();
            // Writing into a String cannot fail.
            let _ = writeln!(buf, "{addr:06X} {}", hex.join(" "));
        }
        Ok(buf)
    }

    // ------------------ COMMANDS ------------------

    /// Attaches a device at the given device number.
    pub fn attach_device(&mut self, id: u8, dev: impl Device) {
        self.device_handler.attach(id, dev);
    }
    /// Gets a reference to the device handler.
    pub fn device_handler(&self) -> &DeviceHandler {
        &self.device_handler
    }
    /// Gets a mutable reference to the device handler.
    pub fn device_handler_mut(&mut self) -> &mut DeviceHandler {
        &mut self.device_handler
    }

    /// Adds a breakpoint, returning whether it was newly added.
    pub fn add_breakpoint(&mut self, bp: Breakpoint) -> bool {
        self.breakpoints.insert(bp)
    }
    /// Removes a breakpoint, returning whether it was present.
    pub fn remove_breakpoint(&mut self, bp: &Breakpoint) -> bool {
        self.breakpoints.remove(bp)
    }
    /// The breakpoints currently set.
    pub fn breakpoints(&self) -> impl Iterator<Item=&Breakpoint> + '_ {
        self.breakpoints.iter()
    }

    /// Indicates whether the last execution of the simulator hit a breakpoint.
    pub fn hit_breakpoint(&self) -> bool {
        matches!(self.pause_condition, PauseCondition::Breakpoint)
    }
    /// Indicates whether the last execution of the simulator ran until the program ended.
    pub fn hit_end(&self) -> bool {
        matches!(self.pause_condition, PauseCondition::Finished)
    }

    /// Whether there is a program and it has not run past the end of memory.
    pub fn has_next(&self) -> bool {
        self.program.is_some() && self.pc() < MEM_SIZE
    }

    /// Runs until the tripwire condition returns false (or any of the typical breaks occur).
    ///
    /// The typical break conditions are:
    /// - the program ends
    /// - A breakpoint matches
    pub fn run_while(&mut self, mut tripwire: impl FnMut(&mut Simulator) -> bool) -> Result<(), SimErr> {
        std::mem::take(&mut self.pause_condition);

        // event loop
        // run until:
        // 1. the program ends
        // 2. the tripwire condition returns false
        // 3. any of the breakpoints are hit
        let result = loop {
            // Tripwire turned off:
            if !tripwire(self) {
                break Ok(PauseCondition::Tripwire);
            }

            // Run a step:
            match self.step() {
                Ok(StepEvent::Finished) => break Ok(PauseCondition::Finished),
                Ok(_) => {},
                Err(e) => break Err(e)
            }

            // After executing, check that any breakpoints were hit.
            if self.breakpoints.iter().any(|bp| bp.check(self)) {
                break Ok(PauseCondition::Breakpoint);
            }
        };

        self.pause_condition = result?;
        Ok(())
    }

    /// Execute the program.
    ///
    /// This blocks until the program ends.
    /// If you would like to limit the maximum number of steps to execute, consider [`Simulator::run_with_limit`].
    pub fn run(&mut self) -> Result<(), SimErr> {
        self.run_while(|_| true)
    }

    /// Execute the program with a limit on how many steps to execute.
    ///
    /// This blocks until the program ends or until the number of steps to execute has been hit.
    pub fn run_with_limit(&mut self, max_steps: u64) -> Result<(), SimErr> {
        let i = self.instructions_run;
        self.run_while(|sim| sim.instructions_run.wrapping_sub(i) < max_steps)
    }

    /// Simulate one step, executing one instruction.
    ///
    /// Filler bytes (see [`FILLER`]) before the next instruction are skipped over.
    /// If there is no instruction before the end of memory, this returns [`StepEvent::Finished`].
    pub fn step(&mut self) -> Result<StepEvent, SimErr> {
        if self.program.is_none() {
            return Err(SimErr::NoProgram);
        }

        let mut addr = self.pc();
        while addr < MEM_SIZE && self.mem.get_byte(addr)? == FILLER {
            addr += 1;
        }
        self.reg_file.set(Reg::PC, addr);
        if addr >= MEM_SIZE {
            return Ok(StepEvent::Finished);
        }

        let Some(instr) = decode(addr, &self.mem, &self.table)? else {
            return self.skip_unknown(addr);
        };

        let next = addr + instr.length;
        self.last_addr = Some(addr);
        self.last_object_code = self.mem.get_bytes(addr, instr.length)?.to_vec();
        self.reg_file.set(Reg::PC, next);
        self.instructions_run += 1;

        let event = match SimInstr::try_from(instr.opcode) {
            Ok(op) => {
                self.last_instruction = Some(op.mnemonic().to_string());
                self.execute(op, &instr, addr, next)?;
                StepEvent::Executed { addr, mnemonic: op.mnemonic() }
            },
            Err(opcode) => {
                let mnemonic = self.table.lookup_opcode(opcode)
                    .map_or_else(|| format!("{opcode:02X}"), |i| i.mnemonic.clone());
                tracing::warn!(addr = format_args!("{addr:06X}"), instr = %mnemonic, "skipping unsupported instruction");
                self.last_instruction = Some(mnemonic.clone());
                self.target_address = None;
                StepEvent::Unsupported { addr, mnemonic }
            }
        };

        if let Some(sect) = self.program.as_ref().and_then(|p| p.section_at(addr)) {
            self.section_pcs.insert(sect.name.clone(), self.pc());
        }
        Ok(event)
    }

    fn skip_unknown(&mut self, addr: u32) -> Result<StepEvent, SimErr> {
        let byte = self.mem.get_byte(addr)?;
        if self.flags.halt_on_unknown_opcode {
            return Err(SimErr::UnknownOpcode { addr, byte });
        }

        tracing::warn!(addr = format_args!("{addr:06X}"), byte = format_args!("{byte:02X}"), "skipping unknown opcode");
        self.last_object_code = vec![byte];
        self.last_instruction = None;
        self.last_addr = Some(addr);
        self.target_address = None;
        self.reg_file.set(Reg::PC, addr + 1);
        Ok(StepEvent::UnknownOpcode { addr, byte })
    }

    /// Computes the target address of a format 3/4 instruction.
    ///
    /// `next` is the address of the following instruction.
    fn compute_target(&self, op: SimInstr, instr: &DecodedInstruction, next: u32) -> Result<Option<u32>, SimErr> {
        let Operands::Memory { flags, disp } = instr.operands else { return Ok(None) };

        let mut ta = if flags.e() {
            match flags.is_immediate() {
                true  => disp as u32 & WORD_MASK,
                false => disp as u32 & 0xF_FFFF,
            }
        } else if flags.p() {
            next.wrapping_add_signed(instr.pc_relative_disp().unwrap_or(disp))
        } else if flags.b() {
            self.reg_file[Reg::B].wrapping_add(disp as u32)
        } else {
            disp as u32
        };

        // LDCH/STCH index their operand even without `,X`, but never twice.
        if flags.x() || matches!(op, SimInstr::LDCH | SimInstr::STCH) {
            ta = ta.wrapping_add(self.reg_file[Reg::X]);
        }
        ta &= WORD_MASK;

        if flags.is_indirect() {
            ta = self.mem.get_word(ta)?;
            // Without a relative base, the displacement points at a pointer to the pointer.
            if !flags.p() && !flags.e() {
                ta = self.mem.get_word(ta)?;
            }
        }

        Ok(Some(ta))
    }

    /// The word operand of an instruction (the target address itself, if immediate).
    fn operand_word(&self, instr: &DecodedInstruction, ta: u32) -> Result<u32, SimErr> {
        match instr.flags().is_some_and(|f| f.is_immediate()) {
            true  => Ok(ta),
            false => self.mem.get_word(ta),
        }
    }
    /// The byte operand of an instruction (the low byte of the target address, if immediate).
    fn operand_byte(&self, instr: &DecodedInstruction, ta: u32) -> Result<u8, SimErr> {
        match instr.flags().is_some_and(|f| f.is_immediate()) {
            true  => Ok(ta as u8),
            false => self.mem.get_byte(ta),
        }
    }

    fn execute(&mut self, op: SimInstr, instr: &DecodedInstruction, addr: u32, next: u32) -> Result<(), SimErr> {
        let ta = self.compute_target(op, instr, next)?;
        self.target_address = ta;

        if self.flags.trace_instructions {
            tracing::trace!(
                addr = format_args!("{addr:06X}"),
                instr = op.mnemonic(),
                code = %self.last_object_code(),
                ta = ?ta,
                "executing"
            );
        }

        let ta = ta.unwrap_or(0);
        let (r1, r2) = match instr.operands {
            Operands::Registers { r1, r2 } => (r1, r2),
            _ => (0, 0),
        };
        let reg = |n: u8| Reg::try_from(n).map_err(SimErr::BadRegister);

        match op {
            SimInstr::LDA => {
                let v = self.operand_word(instr, ta)?;
                self.reg_file.set(Reg::A, v);
            },
            SimInstr::LDT => {
                let v = self.operand_word(instr, ta)?;
                self.reg_file.set(Reg::T, v);
            },
            SimInstr::LDCH => {
                let b = self.operand_byte(instr, ta)?;
                self.reg_file.set(Reg::A, (self.reg_file[Reg::A] & !0xFF) | u32::from(b));
            },
            SimInstr::STA => self.mem.set_word(ta, self.reg_file[Reg::A])?,
            SimInstr::STL => self.mem.set_word(ta, self.reg_file[Reg::L])?,
            SimInstr::STX => self.mem.set_word(ta, self.reg_file[Reg::X])?,
            SimInstr::STCH => self.mem.set_byte(ta, self.reg_file[Reg::A] as u8)?,
            SimInstr::SUB => {
                let v = self.operand_word(instr, ta)?;
                self.reg_file.set(Reg::A, self.reg_file[Reg::A].wrapping_sub(v));
            },
            SimInstr::COMP => {
                // Compares against the target address itself, not the word stored there.
                self.cc = Some(signed(self.reg_file[Reg::A]).cmp(&signed(ta)).into());
            },
            SimInstr::COMPR => {
                let (a, b) = (self.reg_file[reg(r1)?], self.reg_file[reg(r2)?]);
                self.cc = Some(signed(a).cmp(&signed(b)).into());
            },
            SimInstr::CLEAR => self.reg_file.set(reg(r1)?, 0),
            SimInstr::TIXR => {
                let x = (self.reg_file[Reg::X] + 1) & WORD_MASK;
                self.reg_file.set(Reg::X, x);
                self.cc = Some(signed(x).cmp(&signed(self.reg_file[reg(r1)?])).into());
            },
            SimInstr::J => self.reg_file.set(Reg::PC, ta),
            SimInstr::JEQ => if self.cc == Some(ConditionCode::Eq) {
                self.reg_file.set(Reg::PC, ta);
            },
            SimInstr::JLT => if self.cc == Some(ConditionCode::Lt) {
                self.reg_file.set(Reg::PC, ta);
            },
            SimInstr::JSUB => {
                self.reg_file.set(Reg::L, next);
                self.reg_file.set(Reg::PC, ta);
            },
            SimInstr::RSUB => self.reg_file.set(Reg::PC, self.reg_file[Reg::L]),
            SimInstr::TD => {
                let id = self.mem.get_byte(ta)?;
                let ready = self.device_handler.activate(id, ta);
                self.cc = Some(match ready {
                    true  => ConditionCode::Lt,
                    false => ConditionCode::Eq,
                });
            },
            SimInstr::RD => {
                let id = self.mem.get_byte(ta)?;
                let data = self.device_handler.read(id)?;
                self.reg_file.set(Reg::A, (self.reg_file[Reg::A] & !0xFF) | u32::from(data));
            },
            SimInstr::WD => {
                let id = self.mem.get_byte(ta)?;
                self.device_handler.write(id, self.reg_file[Reg::A] as u8)?;
            },
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::asm::assemble;
    use crate::asm::tests::COPY_SRC;
    use crate::ast::{InstrTable, Reg};

    use super::debug::{Breakpoint, Comparator, Width};
    use super::device::BufferedDevice;
    use super::mem::{ConditionCode, MEM_SIZE};
    use super::{SimErr, SimFlags, Simulator, StepEvent};

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn load_src(src: &str) -> Simulator {
        init_tracing();
        let obj = assemble(src, &InstrTable::sicxe()).unwrap();
        let mut sim = Simulator::new(Default::default());
        sim.load(&obj).unwrap();
        sim
    }

    fn copy_sim(input: &[u8]) -> (Simulator, BufferedDevice, BufferedDevice) {
        let mut sim = load_src(COPY_SRC);
        let inp = BufferedDevice::new();
        let out = BufferedDevice::new();
        inp.input().write().unwrap().extend(input);
        sim.attach_device(0xF1, inp.clone());
        sim.attach_device(0x05, out.clone());
        (sim, inp, out)
    }

    #[test]
    fn test_two_sections() {
        let mut sim = load_src("\
MAIN     START   1000
         EXTREF  VAL
FIRST    +LDA    VAL
         RSUB
OTHER    CSECT
         EXTDEF  VAL
VAL      WORD    7
         END     FIRST
");
        assert_eq!(sim.program_name(), Some("MAIN"));
        assert_eq!(sim.program_start(), Some(0x1000));
        assert_eq!(sim.program_length(), Some(10));
        assert_eq!(sim.entry_point(), Some(0x1000));
        assert_eq!(sim.pc(), 0x1000);
        assert_eq!(sim.reg(Reg::L), MEM_SIZE);
        assert_eq!(sim.current_section(), Some("MAIN"));

        let event = sim.step().unwrap();
        assert_eq!(event, StepEvent::Executed { addr: 0x1000, mnemonic: "LDA" });
        assert_eq!(sim.reg(Reg::A), 7);
        assert_eq!(sim.target_address(), Some(0x1007));
        assert_eq!(sim.last_object_code(), "03101007");
        assert_eq!(sim.last_instruction_name(), Some("LDA"));
        assert_eq!(sim.section_pc("MAIN"), Some(0x1004));
        assert_eq!(sim.section_pc("OTHER"), None);

        sim.run().unwrap();
        assert!(sim.hit_end());
        assert!(!sim.has_next());
        assert_eq!(sim.instructions_run(), 2);
        assert_eq!(sim.step().unwrap(), StepEvent::Finished);
    }

    #[test]
    fn test_copy_program() {
        let (mut sim, inp, out) = copy_sim(b"HELLO");

        let program = sim.program().unwrap();
        let addrs: Vec<_> = program.sections.iter().map(|s| (&*s.name, s.addr)).collect();
        assert_eq!(addrs, [("COPY", 0), ("RDREC", 0x1033), ("WRREC", 0x105E)]);
        assert_eq!(sim.program_length(), Some(0x107A));

        sim.run_with_limit(10_000).unwrap();
        assert!(sim.hit_end());
        assert_eq!(&*out.output().read().unwrap(), b"HELLOEOF");
        assert!(inp.input().read().unwrap().is_empty());
        // LENGTH is set to 3 for the EOF record.
        assert_eq!(sim.read_word(0x2D).unwrap(), 3);
        assert_eq!(sim.active_device().map(|d| d.id), Some(0x05));
        assert!(sim.section_pc("RDREC").is_some());
        assert!(sim.section_pc("WRREC").is_some());
    }

    #[test]
    fn test_devices() {
        let src = "\
IO       START   0
         TD      INDEV
         RD      INDEV
         TD      OUTDEV
         WD      OUTDEV
         RSUB
INDEV    BYTE    X'F1'
OUTDEV   BYTE    X'05'
         END
";
        let mut sim = load_src(src);
        let inp = BufferedDevice::new();
        let out = BufferedDevice::new();
        inp.input().write().unwrap().push_back(b'Z');
        sim.attach_device(0xF1, inp);
        sim.attach_device(0x05, out.clone());

        sim.step().unwrap();
        assert_eq!(sim.cc(), Some(ConditionCode::Lt));
        assert!(sim.is_device_active(0xF));
        sim.step().unwrap();
        assert_eq!(sim.reg(Reg::A), u32::from(b'Z'));

        // Testing another device deactivates the first.
        sim.step().unwrap();
        assert!(!sim.is_device_active(0xF));
        assert!(sim.is_device_active(0x10));
        assert!(sim.was_device_activated(0xF));
        assert_eq!(sim.active_device().map(|d| (d.id, d.addr)), Some((0x05, 0x10)));

        sim.run().unwrap();
        assert_eq!(&*out.output().read().unwrap(), b"Z");
    }

    #[test]
    fn test_device_not_active() {
        let mut sim = load_src("P START 0\n RD DEV\n RSUB\nDEV BYTE X'F1'\n END\n");
        assert!(matches!(sim.step(), Err(SimErr::DeviceNotActive(0xF1))));

        let mut sim = load_src("P START 0\n TD DEV1\n WD DEV2\n RSUB\nDEV1 BYTE X'F1'\nDEV2 BYTE X'F2'\n END\n");
        sim.step().unwrap();
        assert!(matches!(sim.run(), Err(SimErr::DeviceNotActive(0xF2))));
    }

    #[test]
    fn test_comp_uses_target_address() {
        let mut sim = load_src("\
P        START   0
         LDA     #5
         COMP    FIVE
         COMP    #5
         RSUB
FIVE     WORD    5
         END
");
        sim.step().unwrap();
        // FIVE is at 0xC, so this compares 5 against 0xC.
        sim.step().unwrap();
        assert_eq!(sim.target_address(), Some(0xC));
        assert_eq!(sim.cc(), Some(ConditionCode::Lt));
        sim.step().unwrap();
        assert_eq!(sim.cc(), Some(ConditionCode::Eq));
    }

    #[test]
    fn test_addressing() {
        let mut sim = load_src("\
P        START   0
         LDA     #2
         STA     IDX
         LDT     IDX
         CLEAR   X
         TIXR    T
         LDCH    STR
         J       @PTR
         RSUB
STR      BYTE    C'ABC'
IDX      RESW    1
PTR      WORD    DONE
DONE     SUB     #1
         RSUB
         END
");
        sim.run().unwrap();
        assert_eq!(sim.reg(Reg::T), 2);
        assert_eq!(sim.reg(Reg::X), 1);
        assert_eq!(sim.cc(), Some(ConditionCode::Lt));
        // LDCH indexes by X without `,X`, then SUB #1.
        assert_eq!(sim.reg(Reg::A), u32::from(b'B') - 1);
        assert_eq!(sim.last_instruction_name(), Some("RSUB"));
    }

    #[test]
    fn test_breakpoints() {
        let (mut sim, _, _) = copy_sim(b"AB");
        let bp = Breakpoint::PC(0x1033);
        assert!(sim.add_breakpoint(bp.clone()));

        sim.run().unwrap();
        assert!(sim.hit_breakpoint());
        assert_eq!(sim.pc(), 0x1033);
        assert_eq!(sim.current_section(), Some("RDREC"));
        assert_eq!(sim.reg(Reg::L), 0x7);

        assert!(sim.remove_breakpoint(&bp));
        let bp = Breakpoint::Section("WRREC".into());
        sim.add_breakpoint(bp.clone());
        sim.run().unwrap();
        assert!(sim.hit_breakpoint());
        assert_eq!(sim.current_section(), Some("WRREC"));
        assert_eq!(sim.read_word(0x2D).unwrap(), 2);

        sim.remove_breakpoint(&bp);
        sim.add_breakpoint(Breakpoint::Reg { reg: Reg::X, value: Comparator::Eq(2) });
        sim.run().unwrap();
        assert_eq!(sim.reg(Reg::X), 2);
    }

    #[test]
    fn test_breakpoint_kinds() {
        let (mut sim, _, _) = copy_sim(b"AB");

        // Section names are loaded symbols
        let bp = Breakpoint::Symbol("RDREC".into());
        sim.add_breakpoint(bp.clone());
        sim.run().unwrap();
        assert!(sim.hit_breakpoint());
        assert_eq!(sim.pc(), 0x1033);
        sim.remove_breakpoint(&bp);

        let bp = Breakpoint::Device(0xF1);
        sim.add_breakpoint(bp.clone());
        sim.run().unwrap();
        assert_eq!(sim.last_instruction_name(), Some("TD"));
        sim.remove_breakpoint(&bp);

        let bp = Breakpoint::Instruction("RD".into());
        sim.add_breakpoint(bp.clone());
        sim.run().unwrap();
        assert_eq!(sim.last_instruction_name(), Some("JEQ"));
        assert_eq!(sim.next_instruction_name(), Some("RD"));
        sim.remove_breakpoint(&bp);

        let bp = Breakpoint::Mem { addr: 0x33, width: Width::Byte, value: Comparator::Eq(i32::from(b'A')) };
        sim.add_breakpoint(bp.clone());
        sim.run().unwrap();
        assert_eq!(sim.last_instruction_name(), Some("STCH"));
        sim.remove_breakpoint(&bp);

        // LENGTH starts as filler, which reads as -1
        let bp = Breakpoint::Mem { addr: 0x2D, width: Width::Word, value: Comparator::Gt(0) };
        sim.add_breakpoint(bp.clone());
        sim.run().unwrap();
        assert_eq!(sim.last_instruction_name(), Some("STX"));
        assert_eq!(sim.read_word(0x2D).unwrap(), 2);
        sim.remove_breakpoint(&bp);

        // Only breaks when control moves into WRREC
        sim.add_breakpoint(Breakpoint::Section("WRREC".into()));
        sim.run().unwrap();
        assert_eq!(sim.pc(), 0x105E);
        assert_eq!(sim.last_instruction_name(), Some("JSUB"));
        let run = sim.instructions_run();

        sim.run().unwrap();
        assert!(sim.hit_breakpoint());
        assert_eq!(sim.pc(), 0x105E);
        assert!(sim.instructions_run() > run + 1);
        assert_eq!(sim.read_word(0x2D).unwrap(), 3);
    }

    #[test]
    fn test_unknown_opcode() {
        let mut sim = Simulator::new(Default::default());
        sim.load_str("HBAD   000000000004\nT00000004FC4F0000\nE000000\n").unwrap();

        assert_eq!(sim.step().unwrap(), StepEvent::UnknownOpcode { addr: 0, byte: 0xFC });
        assert_eq!(sim.pc(), 1);
        assert_eq!(sim.last_object_code(), "FC");
        assert_eq!(sim.step().unwrap(), StepEvent::Executed { addr: 1, mnemonic: "RSUB" });
        assert_eq!(sim.step().unwrap(), StepEvent::Finished);

        let mut sim = Simulator::new(SimFlags { halt_on_unknown_opcode: true, ..Default::default() });
        sim.load_str("HBAD   000000000004\nT00000004FC4F0000\nE000000\n").unwrap();
        assert!(matches!(sim.run(), Err(SimErr::UnknownOpcode { addr: 0, byte: 0xFC })));
        assert_eq!(sim.pc(), 0);
    }

    #[test]
    fn test_unsupported_instruction() {
        let mut sim = load_src("P START 0\n ADD #1\n RSUB\n END\n");
        assert_eq!(sim.step().unwrap(), StepEvent::Unsupported { addr: 0, mnemonic: "ADD".into() });
        assert_eq!(sim.pc(), 3);
        assert_eq!(sim.reg(Reg::A), 0);
        assert_eq!(sim.last_instruction_name(), Some("ADD"));
    }

    #[test]
    fn test_load_errors() {
        let mut sim = Simulator::new(Default::default());
        assert!(matches!(sim.step(), Err(SimErr::NoProgram)));
        assert!(!sim.has_next());

        let result = sim.load_str("HA     000000000003\nT00000003000000\nM00000006+NOPE\nE000000\n");
        assert!(matches!(result, Err(SimErr::UnresolvedSymbol(s)) if s == "NOPE"));
        assert!(sim.program().is_none());
        assert!(matches!(sim.load_str("X"), Err(SimErr::MalformedRecord(_))));
    }

    #[test]
    fn test_dump() {
        let sim = load_src("P START 1000\n RSUB\n END\n");
        assert_eq!(
            sim.dump(0x1000..0x1013).unwrap(),
            "001000 4F 00 00 FF FF FF FF FF FF FF FF FF FF FF FF FF\n001010 FF FF FF\n"
        );
        assert_eq!(sim.dump(0x1000..0x1000).unwrap(), "");
        assert!(sim.dump(MEM_SIZE - 1..MEM_SIZE + 1).is_err());
    }

    #[test]
    fn test_reset() {
        let (mut sim, _, _) = copy_sim(b"A");
        sim.add_breakpoint(Breakpoint::PC(0x1033));
        sim.run().unwrap();

        sim.reset();
        assert!(sim.program().is_none());
        assert_eq!(sim.pc(), 0);
        assert_eq!(sim.cc(), None);
        assert_eq!(sim.active_device(), None);
        assert_eq!(sim.breakpoints().count(), 1);
        assert_eq!(sim.read_byte(0).unwrap(), 0xFF);
    }
}
