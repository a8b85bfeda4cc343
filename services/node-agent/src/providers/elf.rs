//! Statically linked ELF binaries.
//!
//! The host only checks the image; the guest agent supervises the process.

use async_trait::async_trait;
use kiln_agent_api::WorkloadType;

use super::{
    verify_digest, ExecutionProvider, ExecutionProviderParams, GuestControl, ProviderContext,
    ProviderError,
};

const ELF_MAGIC: &[u8; 4] = b"\x7fELF";
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const ET_EXEC: u16 = 2;
const ET_DYN: u16 = 3;
const PT_INTERP: u32 = 3;
const EHDR_LEN: usize = 64;
const PHDR_LEN: usize = 56;

#[cfg(target_arch = "x86_64")]
const HOST_MACHINE: u16 = 62;
#[cfg(target_arch = "aarch64")]
const HOST_MACHINE: u16 = 183;
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
const HOST_MACHINE: u16 = 0;

pub struct ElfProvider {
    params: ExecutionProviderParams,
    guest: GuestControl,
}

impl ElfProvider {
    pub fn new(params: ExecutionProviderParams, ctx: ProviderContext) -> Self {
        let guest = GuestControl::new(ctx, params.machine_id);
        Self { params, guest }
    }
}

/// Checks that `bytes` is a static 64-bit little-endian executable for the
/// host architecture.
pub(crate) fn check_elf(bytes: &[u8]) -> Result<(), String> {
    if bytes.len() < EHDR_LEN || &bytes[..4] != ELF_MAGIC {
        return Err("not an ELF binary".to_string());
    }
    if bytes[4] != ELFCLASS64 {
        return Err("not a 64-bit binary".to_string());
    }
    if bytes[5] != ELFDATA2LSB {
        return Err("not a little-endian binary".to_string());
    }

    let u16_at = |off: usize| u16::from_le_bytes([bytes[off], bytes[off + 1]]);
    let u32_at = |off: usize| u32::from_le_bytes([bytes[off], bytes[off + 1], bytes[off + 2], bytes[off + 3]]);
    let u64_at = |off: usize| {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&bytes[off..off + 8]);
        u64::from_le_bytes(buf)
    };

    let e_type = u16_at(16);
    if e_type != ET_EXEC && e_type != ET_DYN {
        return Err(format!("unsupported ELF type {e_type}"));
    }

    let e_machine = u16_at(18);
    if e_machine != HOST_MACHINE {
        return Err(format!(
            "binary targets machine {e_machine}, host is {HOST_MACHINE}"
        ));
    }

    let phoff = usize::try_from(u64_at(32)).map_err(|_| "program header offset overflow")?;
    let phentsize = usize::from(u16_at(54));
    let phnum = usize::from(u16_at(56));
    if phnum > 0 && phentsize < PHDR_LEN {
        return Err(format!("program header entry size {phentsize} too small"));
    }

    for i in 0..phnum {
        let off = i
            .checked_mul(phentsize)
            .and_then(|rel| phoff.checked_add(rel))
            .filter(|off| off.checked_add(PHDR_LEN).is_some_and(|end| end <= bytes.len()))
            .ok_or("program header table out of bounds")?;
        if u32_at(off) == PT_INTERP {
            return Err("binary is dynamically linked".to_string());
        }
    }

    Ok(())
}

#[async_trait]
impl ExecutionProvider for ElfProvider {
    fn workload_type(&self) -> WorkloadType {
        WorkloadType::Elf
    }

    async fn validate(&self) -> Result<(), ProviderError> {
        verify_digest(&self.params.artifact, self.params.artifact_hash.as_deref())?;
        check_elf(&self.params.artifact).map_err(ProviderError::Validation)
    }

    async fn deploy(&self) -> Result<(), ProviderError> {
        self.guest.deploy(WorkloadType::Elf, &self.params).await
    }

    async fn execute(&self, subject: &str, payload: Vec<u8>) -> Result<Vec<u8>, ProviderError> {
        self.guest.execute(WorkloadType::Elf, subject, payload).await
    }

    async fn undeploy(&self) -> Result<(), ProviderError> {
        self.guest.undeploy().await
    }
}
