// SPDX-License-Identifier: Apache-2.0
//! The brain active item: one VM instance per machine instance, stepped
//! each tick against its bound module's compiled bytecode.
//!
//! This is the one active item type wired end-to-end through the arena +
//! VM dispatch path described by the active subsystem; other item
//! kinds the original engine models (printers, miners, and the rest of its
//! `im_config` catalog) are out of scope here, since nothing in this
//! workspace's spec names their per-kind behavior.

use crate::item::ItemId;
use crate::mod_registry::ModRegistry;
use crate::vm::{Specs, Vm, VmExit};

/// Per-instance state for one brain: its VM, the module it currently
/// executes, and any `io` request still waiting on a host reply.
#[derive(Debug, Clone)]
pub struct BrainState {
    vm: Vm,
    mod_major: u32,
    mod_version: Option<u16>,
    pending_io: Option<Vec<u64>>,
}

impl Default for BrainState {
    fn default() -> Self {
        Self {
            vm: Vm::new(
                Specs {
                    stack_cap: 64,
                    speed: 64,
                },
                0,
            ),
            mod_major: 0,
            mod_version: None,
            pending_io: None,
        }
    }
}

impl BrainState {
    /// Bind this brain to a module, replacing its VM with a fresh one at
    /// `ip = 0`.
    pub fn bind(&mut self, specs: Specs, mod_major: u32, mod_version: Option<u16>) {
        self.vm = Vm::new(specs, mod_major);
        self.mod_major = mod_major;
        self.mod_version = mod_version;
        self.pending_io = None;
    }

    /// The module this brain currently executes.
    #[must_use]
    pub const fn module(&self) -> (u32, Option<u16>) {
        (self.mod_major, self.mod_version)
    }

    /// Read-only access to the underlying VM, e.g. for state snapshots.
    #[must_use]
    pub const fn vm(&self) -> &Vm {
        &self.vm
    }

    /// The words requested by a pending `io`/`ios`, if the brain is
    /// blocked waiting on a host reply.
    #[must_use]
    pub fn pending_io(&self) -> Option<&[u64]> {
        self.pending_io.as_deref()
    }

    /// Supply the host's reply to a pending `io`/`ios` and unblock the VM.
    ///
    /// # Errors
    ///
    /// Returns the VM's fault if the reply is malformed or none was
    /// pending.
    pub fn io_resume(&mut self, reply: &[u64]) -> Result<(), VmExit> {
        self.vm.io_resume(reply)?;
        self.pending_io = None;
        Ok(())
    }

    /// Run one tick: execute opcodes against the bound module's code,
    /// following cross-module `call`/`load` transfers within the same
    /// tick, stopping at a fault, yield, or `io` request.
    ///
    /// A no-op while an `io` reply is still pending, and a no-op if the
    /// bound module can't be found (e.g. it was never published).
    pub fn step(&mut self, mods: &ModRegistry) {
        if self.pending_io.is_some() {
            return;
        }
        loop {
            let Some(module) = mods.get(self.mod_major, self.mod_version) else {
                return;
            };
            match self.vm.exec(&module.code) {
                VmExit::Call { mod_id, ip } | VmExit::Load { mod_id, ip } => {
                    self.mod_major = mod_id;
                    self.mod_version = None;
                    self.vm.mod_id = mod_id;
                    self.vm.set_ip(ip);
                }
                VmExit::Io { len } => {
                    let stack = self.vm.stack();
                    let start = stack.len().saturating_sub(len as usize);
                    self.pending_io = Some(stack[start..].to_vec());
                    return;
                }
                VmExit::Ok | VmExit::Yield | VmExit::Fault(_) => return,
            }
        }
    }
}

/// Arena of brains for one chunk, indexed like any other active item type.
pub type BrainArena = crate::item::Arena<BrainState>;

/// Allocate a brain bound to `mod_major`/`mod_version` and return its id.
pub fn spawn(arena: &mut BrainArena, specs: Specs, mod_major: u32, mod_version: Option<u16>) -> ItemId {
    let id = arena.create();
    if let Some((state, _)) = arena.get_mut(id) {
        state.bind(specs, mod_major, mod_version);
    }
    id
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::vm::{Fault, Op};

    #[test]
    fn steps_bound_module_and_yields() {
        let mut mods = ModRegistry::new();
        let major = mods.register("boot");
        mods.store(major, vec![Op::Tsc as u8, Op::Yield as u8], vec![], vec![]);

        let mut arena = BrainArena::default();
        let id = spawn(&mut arena, Specs { stack_cap: 8, speed: 8 }, major, None);
        let (state, _) = arena.get_mut(id).unwrap();
        state.step(&mods);
        assert!(state.vm().flags().is_suspended());
        assert_eq!(state.vm().stack(), &[0]);
    }

    #[test]
    fn follows_call_into_another_module_same_tick() {
        let mut mods = ModRegistry::new();
        let a = mods.register("a");
        let b = mods.register("b");
        let target = crate::vm::pack_call(b, 0);
        let bytes = target.to_be_bytes();
        let mut code_a = vec![Op::Call as u8];
        code_a.extend_from_slice(&bytes[4..8]);
        code_a.extend_from_slice(&[0, 0, 0]);
        mods.store(a, code_a, vec![], vec![]);
        mods.store(b, vec![Op::Tsc as u8, Op::Yield as u8], vec![], vec![]);

        let mut arena = BrainArena::default();
        let id = spawn(&mut arena, Specs { stack_cap: 8, speed: 8 }, a, None);
        let (state, _) = arena.get_mut(id).unwrap();
        state.step(&mods);

        assert_eq!(state.module().0, b);
        assert!(state.vm().flags().is_suspended());
    }

    #[test]
    fn io_blocks_until_resumed() {
        let mut mods = ModRegistry::new();
        let major = mods.register("io_test");
        mods.store(
            major,
            vec![
                Op::Push as u8,
                0, 0, 0, 0, 0, 0, 0, 7,
                Op::Io as u8, 1,
            ],
            vec![],
            vec![],
        );

        let mut arena = BrainArena::default();
        let id = spawn(&mut arena, Specs { stack_cap: 8, speed: 8 }, major, None);
        let (state, _) = arena.get_mut(id).unwrap();

        state.step(&mods);
        assert_eq!(state.pending_io(), Some(&[7][..]));

        state.step(&mods);
        assert_eq!(state.pending_io(), Some(&[7][..]));

        state.io_resume(&[99]).unwrap();
        assert!(state.pending_io().is_none());
        assert_eq!(state.vm().stack(), &[7, 99]);
    }

    #[test]
    fn missing_module_is_a_no_op() {
        let mods = ModRegistry::new();
        let mut arena = BrainArena::default();
        let id = spawn(&mut arena, Specs { stack_cap: 8, speed: 8 }, 42, None);
        let (state, _) = arena.get_mut(id).unwrap();
        state.step(&mods);
        assert!(!state.vm().flags().is_faulted());
        assert_eq!(state.vm().ip(), 0);
    }

    #[test]
    fn fault_halts_stepping() {
        let mut mods = ModRegistry::new();
        let major = mods.register("div0");
        mods.store(
            major,
            vec![
                Op::Push as u8,
                0, 0, 0, 0, 0, 0, 0, 1,
                Op::Push as u8,
                0, 0, 0, 0, 0, 0, 0, 0,
                Op::Div as u8,
            ],
            vec![],
            vec![],
        );
        let mut arena = BrainArena::default();
        let id = spawn(&mut arena, Specs { stack_cap: 8, speed: 8 }, major, None);
        let (state, _) = arena.get_mut(id).unwrap();
        state.step(&mods);
        assert_eq!(state.vm().flags().fault(), Some(Fault::Math));
    }
}
