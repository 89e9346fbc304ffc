//! Hardware-in-loop tests for the on-flash record chain: mount,
//! create, write/read, remove-and-compact, format, all run against the
//! MCU's own internal flash rather than [`xipfs::mock::MockNvm`].
#![no_std]
#![no_main]

use defmt_rtt as _;
use panic_probe as _;

#[defmt_test::tests]
mod tests {
    use stm32f3xx_hal::pac;
    use testsuite::InternalFlash;
    use xipfs::{Mount, OpenFlags};

    struct State {
        mount: Mount<InternalFlash>,
    }

    #[init]
    fn init() -> State {
        let dp = pac::Peripherals::take().unwrap();
        let flash = InternalFlash::new(dp.FLASH);
        let mut mount = Mount::mount(flash, 0x0800_C000, 0x4000).unwrap();
        mount.format().unwrap();
        State { mount }
    }

    #[test]
    fn create_write_read_roundtrip(state: &mut State) {
        state.mount.new_file("/greeting.txt", 64, false).unwrap();
        let h = state
            .mount
            .open("/greeting.txt", OpenFlags::READ | OpenFlags::WRITE)
            .unwrap();
        let n = state.mount.write(h, b"hello from flash").unwrap();
        defmt::assert_eq!(n, 16);

        state.mount.lseek(h, 0).unwrap();
        let mut buf = [0u8; 16];
        let n = state.mount.read(h, &mut buf).unwrap();
        defmt::assert_eq!(n, 16);
        defmt::assert_eq!(&buf, b"hello from flash");
        state.mount.close(h).unwrap();
    }

    #[test]
    fn duplicate_create_is_rejected(state: &mut State) {
        state.mount.new_file("/dup.bin", 32, false).unwrap();
        let err = state.mount.new_file("/dup.bin", 32, false).unwrap_err();
        defmt::assert_eq!(err, xipfs::DriverError::Exists);
    }

    #[test]
    fn unlink_frees_the_record(state: &mut State) {
        state.mount.new_file("/scratch.bin", 32, false).unwrap();
        let before = state.mount.statvfs().unwrap().free_pages;
        let h = state
            .mount
            .open("/scratch.bin", OpenFlags::READ)
            .unwrap();
        state.mount.close(h).unwrap();
        state.mount.unlink("/scratch.bin").unwrap();
        let after = state.mount.statvfs().unwrap().free_pages;
        defmt::assert!(after >= before);
    }

    #[test]
    fn format_clears_the_whole_mount(state: &mut State) {
        state.mount.new_file("/a.bin", 16, false).unwrap();
        state.mount.new_file("/b.bin", 16, false).unwrap();
        state.mount.format().unwrap();
        defmt::assert!(matches!(
            state.mount.open("/a.bin", OpenFlags::READ),
            Err(xipfs::DriverError::NotFound)
        ));
    }
}
