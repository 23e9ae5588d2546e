use std::fmt;
use std::collections::HashMap;

use log::debug;
use pelite::{PeFile, PeView};
use pelite::Wrap::{T32, T64};
use pelite::pe32::Pe as Pe32;
use pelite::pe64::Pe as Pe64;

use grapple_address::{Address, Base, Offset};

#[derive(Debug)]
pub enum ModuleError {
    ImageParseError(pelite::Error),
}

impl fmt::Display for ModuleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleError::ImageParseError(e) => write!(f, "could not parse module image: {}", e),
        }
    }
}

impl std::error::Error for ModuleError {}

// Both pelite bitnesses expose the same methods under different traits.
macro_rules! export_snapshot {
    ($pe:expr) => {{
        let pe = $pe;
        let size = pe.optional_header().SizeOfImage as usize;
        let exports = pe.exports()
            .and_then(|e| e.by())
            .map(|by| by.iter_names()
                .filter_map(|(name, export)| {
                    let name = name.ok()?.to_str().ok()?.to_string();
                    let rva = export.ok()?.symbol()?;
                    Some((name, Offset::from(rva)))
                })
                .collect::<Vec<_>>())
            .unwrap_or_default();

        (size, exports)
    }};
}

/// Snapshot of a module loaded into a target process.
#[derive(Debug, Clone)]
pub struct LoadedModule {
    pub name: String,
    pub base: Base,
    pub size: Option<usize>,
    exports: HashMap<String, Offset>,
}

impl LoadedModule {
    pub fn new(name: &str, base: Base, exports: Vec<(String, Offset)>) -> Self {
        Self {
            name: name.to_string(),
            base,
            size: None,
            exports: exports.into_iter().collect(),
        }
    }

    /// Builds the export snapshot from the module's file on disk. Forwarded exports are
    /// skipped.
    pub fn from_pe_image(name: &str, base: Base, image: &[u8]) -> Result<Self, ModuleError> {
        let pe = PeFile::from_bytes(image)
            .map_err(ModuleError::ImageParseError)?;

        let (size, exports) = match pe {
            T32(pe) => export_snapshot!(pe),
            T64(pe) => export_snapshot!(pe),
        };

        Ok(Self::with_snapshot(name, base, size, exports))
    }

    /// Same as [`LoadedModule::from_pe_image`] for bytes read from the target at `base`,
    /// where sections sit at their virtual addresses.
    pub fn from_mapped_image(name: &str, base: Base, image: &[u8]) -> Result<Self, ModuleError> {
        let pe = PeView::from_bytes(image)
            .map_err(ModuleError::ImageParseError)?;

        let (size, exports) = match pe {
            T32(pe) => export_snapshot!(pe),
            T64(pe) => export_snapshot!(pe),
        };

        Ok(Self::with_snapshot(name, base, size, exports))
    }

    fn with_snapshot(name: &str, base: Base, size: usize, exports: Vec<(String, Offset)>) -> Self {
        debug!("Module {} exports {} symbols", name, exports.len());

        let mut module = Self::new(name, base, exports);
        module.size = Some(size);
        module
    }

    /// Module names compare the way the loader compares them.
    pub fn is_named(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }

    pub fn export(&self, symbol: &str) -> Option<Address> {
        self.exports.get(symbol)
            .map(|offset| &self.base + offset)
    }

    pub fn exports(&self) -> impl Iterator<Item = (&str, Address)> {
        self.exports.iter()
            .map(|(name, offset)| (name.as_str(), &self.base + offset))
    }

    pub fn contains(&self, address: &Address) -> bool {
        match self.size {
            Some(size) => address.offset_from(&self.base)
                .map_or(false, |o| o.as_usize() < size),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn module() -> LoadedModule {
        LoadedModule::new(
            "Logger.dll",
            Base::from(0x10000000usize),
            vec![
                ("GRAPPLE_logMessage".to_string(), Offset::from(0x1010usize)),
                ("GRAPPLE_finishedTest".to_string(), Offset::from(0x1020usize)),
            ],
        )
    }

    #[test]
    fn we_can_look_up_exports() {
        let module = module();

        assert_eq!(module.export("GRAPPLE_logMessage"), Some(Address::from(0x10001010usize)));
        assert_eq!(module.export("GRAPPLE_startingTest"), None);
        assert_eq!(module.exports().count(), 2);
    }

    #[test]
    fn module_names_ignore_case() {
        assert!(module().is_named("logger.DLL"));
        assert!(!module().is_named("logger.dl"));
    }

    #[test]
    fn containment_needs_a_known_size() {
        let mut module = module();
        let inside = Address::from(0x10001000usize);

        assert!(!module.contains(&inside));

        module.size = Some(0x2000);
        assert!(module.contains(&inside));
        assert!(!module.contains(&Address::from(0x10002000usize)));
        assert!(!module.contains(&Address::from(0x0FFFFFFFusize)));
    }

    #[repr(C, align(16))]
    struct Image([u8; 0x400]);

    fn put(image: &mut Image, offset: usize, bytes: &[u8]) {
        image.0[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    // Headers followed by an export directory at 0x200, laid out as the loader maps it.
    fn mapped_image() -> Image {
        let mut image = Image([0; 0x400]);

        put(&mut image, 0x00, b"MZ");
        put(&mut image, 0x3C, &0x40u32.to_le_bytes());
        put(&mut image, 0x40, b"PE\0\0");
        put(&mut image, 0x44, &0x8664u16.to_le_bytes());
        put(&mut image, 0x54, &0xF0u16.to_le_bytes());
        put(&mut image, 0x56, &0x2022u16.to_le_bytes());

        let optional = 0x58;
        put(&mut image, optional, &0x20Bu16.to_le_bytes());
        put(&mut image, optional + 0x20, &0x1000u32.to_le_bytes());
        put(&mut image, optional + 0x24, &0x200u32.to_le_bytes());
        put(&mut image, optional + 0x38, &0x400u32.to_le_bytes());
        put(&mut image, optional + 0x3C, &0x200u32.to_le_bytes());
        put(&mut image, optional + 0x6C, &16u32.to_le_bytes());
        put(&mut image, optional + 0x70, &0x200u32.to_le_bytes());
        put(&mut image, optional + 0x74, &0x100u32.to_le_bytes());

        put(&mut image, 0x210, &1u32.to_le_bytes());
        put(&mut image, 0x214, &2u32.to_le_bytes());
        put(&mut image, 0x218, &2u32.to_le_bytes());
        put(&mut image, 0x21C, &0x240u32.to_le_bytes());
        put(&mut image, 0x220, &0x250u32.to_le_bytes());
        put(&mut image, 0x224, &0x260u32.to_le_bytes());

        put(&mut image, 0x240, &0x1010u32.to_le_bytes());
        put(&mut image, 0x244, &0x1020u32.to_le_bytes());
        put(&mut image, 0x250, &0x270u32.to_le_bytes());
        put(&mut image, 0x254, &0x290u32.to_le_bytes());
        put(&mut image, 0x260, &0u16.to_le_bytes());
        put(&mut image, 0x262, &1u16.to_le_bytes());
        put(&mut image, 0x270, b"GRAPPLE_finishedTest\0");
        put(&mut image, 0x290, b"GRAPPLE_logMessage\0");

        image
    }

    #[test]
    fn we_can_snapshot_a_mapped_image() {
        let image = mapped_image();
        let module = LoadedModule::from_mapped_image("logger.dll", Base::from(0x10000000usize), &image.0).unwrap();

        assert_eq!(module.size, Some(0x400));
        assert_eq!(module.exports().count(), 2);
        assert_eq!(module.export("GRAPPLE_finishedTest"), Some(Address::from(0x10001010usize)));
        assert_eq!(module.export("GRAPPLE_logMessage"), Some(Address::from(0x10001020usize)));
    }

    #[test]
    fn garbage_images_are_rejected() {
        let result = LoadedModule::from_pe_image("x.dll", Base::from(0usize), &[0u8; 0x40]);

        assert!(matches!(result, Err(ModuleError::ImageParseError(_))));

        let result = LoadedModule::from_mapped_image("x.dll", Base::from(0usize), &[0u8; 0x40]);
        assert!(matches!(result, Err(ModuleError::ImageParseError(_))));
    }
}
