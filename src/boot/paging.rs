//! Page table and CPU register setup for 64-bit Linux boot.
//!
//! This module configures the x86_64 CPU state required to boot Linux in 64-bit
//! long mode. The Linux boot protocol requires the CPU to be in a specific state
//! when entering the kernel's 64-bit entry point.
//!
//! # x86_64 Long Mode Requirements
//!
//! To run in 64-bit long mode, the CPU must have:
//!
//! 1. **Paging enabled** (CR0.PG = 1)
//! 2. **Physical Address Extension** (CR4.PAE = 1)
//! 3. **Long Mode Enable** in EFER MSR (EFER.LME = 1)
//! 4. **Long Mode Active** in EFER MSR (EFER.LMA = 1, set automatically)
//! 5. **Page tables** set up with CR3 pointing to PML4
//!
//! # Page Table Structure
//!
//! x86_64 uses a 4-level page table hierarchy:
//!
//! ```text
//! CR3 → PML4 (Page Map Level 4) → PDPTE → PDE → PTE → Physical Page
//!       512 entries              512     512    512
//!       each covers 512GB        1GB     2MB    4KB
//! ```
//!
//! For simplicity, we use 2MB "huge pages" which eliminates the PTE level:
//!
//! ```text
//! CR3 → PML4 → PDPTE → PDE (with PS bit) → 2MB Physical Page
//! ```
//!
//! This gives us identity-mapped (virtual = physical) access to the first 1GB
//! of memory, which is sufficient for early kernel boot. The kernel sets up
//! its own page tables during initialization and can map all available memory.
//!
//! # Global Descriptor Table (GDT)
//!
//! Even though segmentation is mostly disabled in long mode, the GDT is still
//! required. The CPU needs:
//!
//! - **Null descriptor** (index 0): Required, never used
//! - **Code segment** (CS): Must have L bit set for 64-bit mode
//! - **Data segment** (DS/ES/FS/GS/SS): Standard data segment
//! - **TSS** (TR): Task State Segment descriptor
//!
//! Note: The TSS GDT entry points to base 0, which isn't a real TSS structure.
//! This works because KVM uses its own TSS set up via `set_tss_address()`, not ours.
//! The GDT TSS entry is just needed so the TR register can be loaded with a valid selector.
//!
//! # Interrupt Descriptor Table (IDT)
//!
//! We provide a minimal (empty) IDT. The kernel immediately sets up its own IDT
//! during early initialization, so ours is just a placeholder to satisfy CPU
//! requirements. The IDT we provide has limit 0 (no valid entries).
//!
//! # Register Setup for Linux Boot
//!
//! The Linux 64-bit boot protocol expects:
//!
//! - **RIP**: Kernel entry point (load_address + 0x200)
//! - **RSI**: Pointer to boot_params structure
//! - **RSP/RBP**: Valid stack pointer
//! - **RFLAGS**: Interrupts disabled, reserved bit 1 set
//! - **CS**: 64-bit code segment
//! - **DS/ES/FS/GS/SS**: Valid data segments
//!
//! Reference: <https://www.kernel.org/doc/html/latest/x86/boot.html#id1>

use super::layout;
use super::BootError;
use crate::backend::{GpRegs, Segment, SpecialRegs};
use crate::memory::MemoryManager;

// ============================================================================
// Page Table Addresses
// ============================================================================

/// PML4 (Page Map Level 4) table address.
///
/// This is the top-level page table, pointed to by CR3.
/// Each entry covers 512GB of virtual address space.
const PML4_START: u64 = 0x9000;

/// PDPTE (Page Directory Pointer Table Entry) address.
///
/// Second level of the page table hierarchy.
/// Each entry covers 1GB of virtual address space.
const PDPTE_START: u64 = 0xa000;

/// PDE (Page Directory Entry) table address.
///
/// Third level of the page table hierarchy.
/// With 2MB pages (PS bit set), each entry maps directly to a 2MB physical page.
const PDE_START: u64 = 0xb000;

// ============================================================================
// Control Register Flags
// ============================================================================

/// CR0.PE - Protection Enable.
///
/// Enables protected mode. Must be set for long mode to work.
/// When PE=1, the CPU uses segment descriptors from the GDT/LDT.
const X86_CR0_PE: u64 = 0x1;

/// CR0.PG - Paging Enable.
///
/// Enables paging. Must be set for long mode.
/// When PG=1, virtual addresses are translated through page tables.
const X86_CR0_PG: u64 = 0x8000_0000;

/// CR4.PAE - Physical Address Extension.
///
/// Enables 64-bit page table entries, required for long mode.
/// With PAE, page tables use 64-bit entries (vs 32-bit without PAE).
const X86_CR4_PAE: u64 = 0x20;

/// EFER.LME - Long Mode Enable.
///
/// Setting this bit enables long mode (will become active when paging is enabled).
/// Located in the EFER (Extended Feature Enable Register) MSR.
const EFER_LME: u64 = 0x100;

/// EFER.LMA - Long Mode Active.
///
/// This bit is set automatically by the CPU when LME=1 and paging is enabled.
/// We set it explicitly to match expected state.
const EFER_LMA: u64 = 0x400;

// ============================================================================
// GDT Configuration
// ============================================================================
//
// The 64-bit Linux boot protocol requires specific segment selectors:
//   - __BOOT_CS = 0x10 (code segment)
//   - __BOOT_DS = 0x18 (data segment)
//
// Reference: Documentation/arch/x86/boot.rst section "64-bit Boot Protocol"

/// GDT entry index for code segment (__BOOT_CS = 0x10).
const GDT_CODE: u16 = 2;

/// GDT entry index for data segment (__BOOT_DS = 0x18).
const GDT_DATA: u16 = 3;

/// Pre-computed GDT entries matching Linux 64-bit boot protocol.
///
/// Layout:
///   0x00: NULL descriptor (required)
///   0x08: Reserved (unused, for alignment)
///   0x10: CODE (__BOOT_CS) - 64-bit code segment
///   0x18: DATA (__BOOT_DS) - data segment
///   0x20: TSS - Task State Segment
const GDT_TABLE: [u64; 5] = [
    gdt_entry(0, 0, 0),            // 0x00: NULL descriptor (required)
    gdt_entry(0, 0, 0),            // 0x08: Reserved
    gdt_entry(0xa09b, 0, 0xfffff), // 0x10: CODE (__BOOT_CS) - 64-bit, execute/read
    gdt_entry(0xc093, 0, 0xfffff), // 0x18: DATA (__BOOT_DS) - read/write
    gdt_entry(0x808b, 0, 0xfffff), // 0x20: TSS - Task State Segment
];

/// Pre-computed PDE entries for identity mapping first 1GB.
///
/// Each entry maps a 2MB page with flags: Present + Read/Write + Page Size (2MB).
/// Entry i maps virtual [i*2MB, (i+1)*2MB) to physical [i*2MB, (i+1)*2MB).
const fn compute_pde_entries() -> [u64; 512] {
    let mut entries = [0u64; 512];
    let mut i = 0;
    while i < 512 {
        // Physical address = i * 2MB, flags = 0x83 (Present + R/W + PS)
        entries[i] = ((i as u64) << 21) | 0x83;
        i += 1;
    }
    entries
}

/// Pre-computed PDE table for identity mapping.
const PDE_ENTRIES: [u64; 512] = compute_pde_entries();

/// Set up identity-mapped page tables for the first 1GB of memory.
///
/// Creates a simple page table hierarchy using 2MB pages:
///
/// ```text
/// PML4[0] → PDPTE[0] → PDE[0..511] → 2MB pages at 0MB, 2MB, 4MB, ... 1022MB
/// ```
///
/// This maps virtual addresses 0x0 - 0x3FFFFFFF to the same physical addresses
/// (identity mapping), which is what the kernel expects during early boot.
pub fn setup_page_tables(memory: &MemoryManager) -> Result<(), BootError> {
    // PML4 entry 0: Points to PDPTE table
    // Flags 0x03 = Present + Read/Write
    memory.write_u64(PML4_START, PDPTE_START | 0x03)?;

    // PDPTE entry 0: Points to PDE table
    // Flags 0x03 = Present + Read/Write
    memory.write_u64(PDPTE_START, PDE_START | 0x03)?;

    // Write all 512 PDE entries at once
    // Each entry is 8 bytes, so we write 4096 bytes total
    let pde_bytes: &[u8] =
        unsafe { std::slice::from_raw_parts(PDE_ENTRIES.as_ptr() as *const u8, 512 * 8) };
    memory.write(PDE_START, pde_bytes)?;

    Ok(())
}

/// Construct a GDT (Global Descriptor Table) entry.
///
/// GDT entries are 8 bytes with a complex layout for historical reasons.
/// This is a const fn so entries can be computed at compile time.
const fn gdt_entry(flags: u16, base: u32, limit: u32) -> u64 {
    ((base as u64 & 0xff00_0000) << 32)
        | ((base as u64 & 0x00ff_ffff) << 16)
        | (limit as u64 & 0x0000_ffff)
        | (((limit as u64 & 0x000f_0000) >> 16) << 48)
        | ((flags as u64) << 40)
}

/// Build a generic segment descriptor from a GDT entry. `access` packs
/// type/present/dpl the same way every `Backend::set_sregs` impl expects to
/// unpack them (type in bits 0-3, dpl in bits 5-6, present in bit 7).
fn segment_from_gdt(entry: u64, table_index: u8) -> Segment {
    let type_ = (entry >> 40) & 0xf;
    let present = (entry >> 47) & 0x1;
    let dpl = (entry >> 45) & 0x3;
    Segment {
        selector: u16::from(table_index) * 8,
        base: (((entry >> 16) & 0xff_ffff) | (((entry >> 56) & 0xff) << 24)) as u64,
        limit: ((entry & 0xffff) | (((entry >> 48) & 0xf) << 16)) as u32,
        access: (type_ | (dpl << 5) | (present << 7)) as u32,
    }
}

/// Set up the GDT and IDT in guest memory.
fn setup_gdt_idt(memory: &MemoryManager) -> Result<(), BootError> {
    // Write GDT entries to guest memory (5 entries × 8 bytes = 40 bytes)
    let gdt_bytes: &[u8] =
        unsafe { std::slice::from_raw_parts(GDT_TABLE.as_ptr() as *const u8, GDT_TABLE.len() * 8) };
    memory.write(layout::GDT_START, gdt_bytes)?;

    // Write a minimal IDT (just zeros)
    // The kernel will set up its own IDT during initialization
    memory.write_u64(layout::IDT_START, 0)?;

    Ok(())
}

/// Compute the CPU register state for 64-bit Linux boot.
///
/// Writes the GDT/IDT into guest memory and returns the `GpRegs`/`SpecialRegs`
/// pair the vCPU must start with:
///
/// 1. **GDT/IDT**: descriptor tables in memory
/// 2. **Segment registers**: loaded from GDT (CS, DS, ES, FS, GS, SS)
/// 3. **Control registers**: protected mode and paging enabled
/// 4. **EFER MSR**: long mode enabled
/// 5. **General registers**: entry point, stack, boot_params pointer
///
/// The registers are only computed here, not applied - the vCPU handle
/// doesn't exist yet at this point in the generalized boot flow (it's
/// created inside the vCPU's own worker thread). FPU state is a
/// backend-level concern (set as part of `Backend::create_vcpu`), not
/// part of the boot protocol itself, so it isn't part of this result.
pub fn compute_cpu_regs(memory: &MemoryManager) -> Result<(GpRegs, SpecialRegs), BootError> {
    setup_gdt_idt(memory)?;

    let code_seg = segment_from_gdt(GDT_TABLE[GDT_CODE as usize], GDT_CODE as u8);
    let data_seg = segment_from_gdt(GDT_TABLE[GDT_DATA as usize], GDT_DATA as u8);

    let sregs = SpecialRegs {
        cs: code_seg,
        ds: data_seg,
        es: data_seg,
        fs: data_seg,
        gs: data_seg,
        ss: data_seg,
        gdt_base: layout::GDT_START,
        gdt_limit: (std::mem::size_of_val(&GDT_TABLE) - 1) as u32,
        idt_base: layout::IDT_START,
        idt_limit: 0,
        cr0: X86_CR0_PE | X86_CR0_PG,
        cr2: 0,
        cr3: PML4_START,
        cr4: X86_CR4_PAE,
        efer: EFER_LME | EFER_LMA,
    };

    log::debug!(
        "cpu sregs: cr0={:#x} cr3={:#x} cr4={:#x} efer={:#x}",
        sregs.cr0, sregs.cr3, sregs.cr4, sregs.efer
    );

    let regs = GpRegs {
        rflags: 0x2,
        rip: layout::HIMEM_START + 0x200,
        rsp: layout::BOOT_STACK_POINTER,
        rbp: layout::BOOT_STACK_POINTER,
        rsi: layout::BOOT_PARAMS_START,
        ..Default::default()
    };

    log::debug!(
        "cpu regs: rip={:#x} rsp={:#x} rsi={:#x} (boot_params)",
        regs.rip, regs.rsp, regs.rsi
    );

    Ok((regs, sregs))
}
