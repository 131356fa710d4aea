//! Just enough ACPI to walk the root table. Table contents are left to their consumers.

use core::{fmt, slice};

use crate::memory::DirectMap;

/// System Description Table Header
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
pub struct SdtHeader {
    pub signature: [u8; 4],
    pub length: u32,
    pub revision: u8,
    pub checksum: u8,
    pub oemid: [u8; 6],
    pub oem_table_id: [u8; 8],
    pub oem_revision: u32,
    pub creator_id: u32,
    pub creator_revision: u32,
}

impl SdtHeader {
    pub fn signature(&self) -> &str {
        core::str::from_utf8(&self.signature).unwrap_or("????")
    }
}

/// Root System Description Pointer
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
pub struct Rsdp {
    pub signature: [u8; 8],
    pub checksum: u8,
    pub oemid: [u8; 6],
    pub revision: u8,
    pub rsdt_address: u32,
    pub length: u32,
    pub xsdt_address: u64,
    pub extended_checksum: u8,
    pub reserved: [u8; 3],
}

const RSDP_SIGNATURE: &[u8; 8] = b"RSD PTR ";

/// Bytes covered by the revision 0 checksum.
const RSDP_V1_LENGTH: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcpiError {
    BadRsdpSignature,
    BadRsdpChecksum,
    BadRootSignature([u8; 4]),
}

impl fmt::Display for AcpiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AcpiError::BadRsdpSignature => f.write_str("bad rsdp signature"),
            AcpiError::BadRsdpChecksum => f.write_str("bad rsdp checksum"),
            AcpiError::BadRootSignature(signature) => {
                write!(f, "bad root table signature {signature:?}")
            }
        }
    }
}

fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |sum, &byte| sum.wrapping_add(byte))
}

/// The RSDT (32-bit entries) or XSDT (64-bit entries) the RSDP points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootTable {
    Rsdt(u64),
    Xsdt(u64),
}

impl RootTable {
    /// Validates the RSDP at `rsdp_phys` and picks its root table: the XSDT from revision 2
    /// on, the RSDT before. The root table itself is not touched.
    pub fn from_rsdp(rsdp_phys: u64, direct_map: DirectMap) -> Result<Self, AcpiError> {
        // SAFETY: the caller hands us the bootloader's RSDP, reachable through the direct map.
        let rsdp = unsafe { direct_map.ptr::<Rsdp>(rsdp_phys).read_unaligned() };

        if &rsdp.signature != RSDP_SIGNATURE {
            return Err(AcpiError::BadRsdpSignature);
        }

        let bytes = unsafe { slice::from_raw_parts(direct_map.ptr::<u8>(rsdp_phys), size_of::<Rsdp>()) };

        if checksum(&bytes[..RSDP_V1_LENGTH]) != 0 {
            return Err(AcpiError::BadRsdpChecksum);
        }

        let root = if rsdp.revision >= 2 {
            if checksum(bytes) != 0 {
                return Err(AcpiError::BadRsdpChecksum);
            }

            RootTable::Xsdt(rsdp.xsdt_address)
        } else {
            RootTable::Rsdt(u64::from(rsdp.rsdt_address))
        };

        Ok(root)
    }

    /// Like [`RootTable::from_rsdp`], and also checks the root table's signature.
    pub fn locate(rsdp_phys: u64, direct_map: DirectMap) -> Result<Self, AcpiError> {
        let root = Self::from_rsdp(rsdp_phys, direct_map)?;

        let signature = read_header(root.address(), direct_map).signature;
        let expected = match root {
            RootTable::Rsdt(_) => b"RSDT",
            RootTable::Xsdt(_) => b"XSDT",
        };

        if &signature != expected {
            return Err(AcpiError::BadRootSignature(signature));
        }

        Ok(root)
    }

    pub fn address(&self) -> u64 {
        match *self {
            RootTable::Rsdt(address) | RootTable::Xsdt(address) => address,
        }
    }

    fn entry_size(&self) -> usize {
        match self {
            RootTable::Rsdt(_) => 4,
            RootTable::Xsdt(_) => 8,
        }
    }

    /// Physical addresses of every table the root lists, in order.
    pub fn tables(self, direct_map: DirectMap) -> impl Iterator<Item = u64> {
        let length = read_header(self.address(), direct_map).length as usize;
        let count = length.saturating_sub(size_of::<SdtHeader>()) / self.entry_size();
        let entries = self.address() + size_of::<SdtHeader>() as u64;

        (0..count).map(move |i| {
            let entry = entries + (i * self.entry_size()) as u64;

            // Entries are only 4-byte aligned, even in the XSDT.
            unsafe {
                match self {
                    RootTable::Rsdt(_) => u64::from(direct_map.ptr::<u32>(entry).read_unaligned()),
                    RootTable::Xsdt(_) => direct_map.ptr::<u64>(entry).read_unaligned(),
                }
            }
        })
    }
}

/// Copies out the header of the table at `phys`.
pub fn read_header(phys: u64, direct_map: DirectMap) -> SdtHeader {
    unsafe { direct_map.ptr::<SdtHeader>(phys).read_unaligned() }
}

#[cfg(test)]
pub(crate) mod tests {
    extern crate std;

    use std::vec::Vec;

    use super::*;
    use crate::testing::PhysArena;

    pub(crate) fn header(signature: &[u8; 4], length: usize) -> SdtHeader {
        SdtHeader {
            signature: *signature,
            length: length as u32,
            revision: 1,
            checksum: 0,
            oemid: *b"SUNRSE",
            oem_table_id: *b"TESTTABL",
            oem_revision: 1,
            creator_id: 0,
            creator_revision: 0,
        }
    }

    pub(crate) fn rsdp(revision: u8, rsdt: u32, xsdt: u64) -> Rsdp {
        let mut rsdp = Rsdp {
            signature: *RSDP_SIGNATURE,
            checksum: 0,
            oemid: *b"SUNRSE",
            revision,
            rsdt_address: rsdt,
            length: size_of::<Rsdp>() as u32,
            xsdt_address: xsdt,
            extended_checksum: 0,
            reserved: [0; 3],
        };

        let bytes = |rsdp: &Rsdp| unsafe {
            slice::from_raw_parts((rsdp as *const Rsdp).cast::<u8>(), size_of::<Rsdp>()).to_vec()
        };

        rsdp.checksum = 0u8.wrapping_sub(checksum(&bytes(&rsdp)[..RSDP_V1_LENGTH]));
        rsdp.extended_checksum = 0u8.wrapping_sub(checksum(&bytes(&rsdp)));
        rsdp
    }

    /// Lays out an RSDP at page 0, an XSDT at page 1 and one table per signature after it.
    pub(crate) fn build_xsdt(arena: &mut PhysArena, base: u64, signatures: &[&[u8; 4]]) -> Vec<u64> {
        let xsdt = base + 0x1000;
        let tables: Vec<u64> = (0..signatures.len())
            .map(|i| base + 0x2000 + i as u64 * 0x100)
            .collect();

        arena.write(base, rsdp(2, 0, xsdt));
        arena.write(xsdt, header(b"XSDT", size_of::<SdtHeader>() + 8 * tables.len()));

        for (i, (&table, signature)) in tables.iter().zip(signatures).enumerate() {
            arena.write(xsdt + size_of::<SdtHeader>() as u64 + 8 * i as u64, table);
            arena.write(table, header(signature, size_of::<SdtHeader>()));
        }

        tables
    }

    #[test]
    fn xsdt_lists_tables_in_order() {
        let mut arena = PhysArena::new(4);
        let base = crate::testing::ARENA_PHYS_BASE;
        let tables = build_xsdt(&mut arena, base, &[b"FACP", b"APIC", b"HPET"]);
        let direct_map = arena.direct_map();

        let root = RootTable::locate(base, direct_map).unwrap();
        assert_eq!(root, RootTable::Xsdt(base + 0x1000));

        let found: Vec<u64> = root.tables(direct_map).collect();
        assert_eq!(found, tables);

        let signatures: Vec<[u8; 4]> = found
            .iter()
            .map(|&table| read_header(table, direct_map).signature)
            .collect();
        assert_eq!(signatures, [*b"FACP", *b"APIC", *b"HPET"]);
    }

    #[test]
    fn revision_zero_walks_the_rsdt() {
        let mut arena = PhysArena::new(4);
        let base = crate::testing::ARENA_PHYS_BASE;
        let rsdt = base + 0x1000;
        let table = base + 0x2000;

        arena.write(base, rsdp(0, rsdt as u32, 0));
        arena.write(rsdt, header(b"RSDT", size_of::<SdtHeader>() + 4));
        arena.write(rsdt + size_of::<SdtHeader>() as u64, table as u32);

        let direct_map = arena.direct_map();
        let root = RootTable::locate(base, direct_map).unwrap();

        assert_eq!(root, RootTable::Rsdt(rsdt));
        assert_eq!(root.tables(direct_map).collect::<Vec<_>>(), [table]);
    }

    #[test]
    fn corrupt_rsdp_is_rejected() {
        let mut arena = PhysArena::new(4);
        let base = crate::testing::ARENA_PHYS_BASE;

        build_xsdt(&mut arena, base, &[]);
        arena.write(base + 9, 0x42u8);

        assert_eq!(
            RootTable::locate(base, arena.direct_map()),
            Err(AcpiError::BadRsdpChecksum)
        );

        arena.write(base, *b"NOT RSDP");

        assert_eq!(
            RootTable::locate(base, arena.direct_map()),
            Err(AcpiError::BadRsdpSignature)
        );
    }
}
