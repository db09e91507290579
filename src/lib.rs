//! A SIC/XE assembler, linking loader, and simulator.
//!
//! This is meant to be a general suite to use SIC/XE assembly:
//! a two-pass assembler producing relocatable object programs,
//! a loader which links their control sections together in memory,
//! and a simulator which executes the result.
//!
//! # Usage
//!
//! To convert SIC/XE source code to an object program, it must be assembled
//! with an instruction table:
//! ```
//! use sicxe_ensemble::asm::assemble;
//! use sicxe_ensemble::ast::InstrTable;
//!
//! let code = "\
//! PROG     START   0
//!          LDA     FIVE
//!          RSUB
//! FIVE     WORD    5
//!          END
//! ";
//! let obj = assemble(code, &InstrTable::sicxe()).unwrap();
//!
//! // Object programs are written in the classic fixed-width record format:
//! assert_eq!(obj.to_string(), "\
//! HPROG  000000000009
//! T000000090320034F0000000005
//! E000000
//! ");
//! ```
//!
//! Once an object program has been created, it can be executed with the simulator:
//! ```
//! # use sicxe_ensemble::asm::assemble;
//! # use sicxe_ensemble::ast::InstrTable;
//! # let code = "PROG START 0\n LDA FIVE\n RSUB\nFIVE WORD 5\n END\n";
//! # let obj = assemble(code, &InstrTable::sicxe()).unwrap();
//! use sicxe_ensemble::ast::Reg;
//! use sicxe_ensemble::sim::Simulator;
//!
//! let mut simulator = Simulator::new(Default::default());
//! simulator.load(&obj).unwrap();
//! simulator.run().unwrap(); // <-- Result can be handled accordingly
//!
//! assert_eq!(simulator.reg(Reg::A), 5);
//! ```
//!
//! If more granularity is needed for simulation, there are also step functions.
//! See the [`sim`] module for more details.
#![warn(missing_docs)]

pub mod parse;
pub mod ast;
pub mod asm;
pub mod sim;
pub mod err;
