//! Black-box end-to-end scenarios for the DFU driver and memory-map layer
//! against the in-memory DFU mock transport. Reference: spec section 8
//! ("End-to-end scenarios", S6-S8).

use particle_usb_host::dfu::{memory, DfuDriver};
use particle_usb_host::mock::{MockDfuStateHandle, MockDfuTransport};
use particle_usb_host::Error;

/// Opens a `DfuDriver` over `transport`, returning it alongside a handle
/// that survives the transport being boxed and moved into the driver.
fn open(transport: MockDfuTransport) -> (DfuDriver, MockDfuStateHandle) {
    let _ = env_logger::try_init();
    let handle = transport.state_handle();
    let mut driver = DfuDriver::new(Box::new(transport));
    driver.open().expect("dfu driver opens");
    (driver, handle)
}

#[test]
fn s6_leave_accepts_the_gen2_manifest_quirk() {
    // A Gen2 device reports `dfuDNLOAD_IDLE` instead of `dfuMANIFEST` after
    // the zero-length manifest-triggering DNLOAD; `leave()` must still
    // succeed, and the final polled state must be the quirky one, not a
    // coincidental `dfuMANIFEST` (spec section 9, second Open Question; spec
    // section 8, scenario S6).
    let transport = MockDfuTransport::new("@Flash/0x08000000/04*004Kg").with_gen2_manifest_quirk();
    let (driver, handle) = open(transport);

    driver.leave().expect("leave() should accept the gen2 quirk");
    assert_eq!(handle.device_state(), particle_usb_host::dfu::DeviceStateCode::dfuDNLOAD_IDLE);
}

#[test]
fn s7_erase_issues_one_command_per_sector_at_the_right_addresses() {
    let transport = MockDfuTransport::new("@Flash/0x08000000/04*004Kg");
    let (mut driver, handle) = open(transport);

    let mut total_erased = 0u32;
    memory::erase(&mut driver, 0x0800_0000, 4 * 4096, |event| {
        if let memory::ProgressEvent::Erased { bytes } = event {
            total_erased += bytes;
        }
    })
    .expect("erase over a fully erasable segment should succeed");

    assert_eq!(total_erased, 4 * 4096);
    assert_eq!(
        handle.erase_log(),
        vec![0x0800_0000, 0x0800_1000, 0x0800_2000, 0x0800_3000]
    );
}

#[test]
fn s7_erase_skips_non_erasable_segments_without_issuing_a_command() {
    // Segment A (0x08000000..0x08004000) is read-only/non-erasable; segment
    // B is fully erasable. Erasing across both must skip A's sector silently
    // but still issue one command per sector of B.
    let transport = MockDfuTransport::new("@Flash/0x08000000/01*016Ka,01*016Kg");
    let (mut driver, handle) = open(transport);

    memory::erase(&mut driver, 0x0800_0000, 0x8000, |_event| {}).unwrap();

    assert_eq!(handle.erase_log(), vec![0x0800_4000]);
}

#[test]
fn s8_download_into_unwritable_segment_is_rejected_before_any_dnload() {
    // Segment A (0x08000000..0x08004000) is read-only; segment B is fully
    // read/erase/write. `do_download` into segment A must reject with
    // `DeviceProtection` before issuing a single DfuSe command.
    let transport = MockDfuTransport::new("@Flash/0x08000000/01*016Ka,03*016Kg");
    let (mut driver, handle) = open(transport);

    let data = vec![0xAAu8; 16];
    let err = memory::do_download(
        &mut driver,
        memory::DownloadRequest {
            start_addr: 0x0800_0000,
            data: &data,
            no_erase: false,
            leave: false,
        },
        |_event| {},
    )
    .unwrap_err();

    assert!(matches!(
        err,
        Error::DeviceProtection {
            address: 0x0800_0000,
            operation: "write",
        }
    ));
    assert!(handle.erase_log().is_empty());
    assert!(handle.download_log().is_empty());
}

#[test]
fn s8_download_into_writable_segment_erases_then_writes() {
    let transport = MockDfuTransport::new("@Flash/0x08000000/01*016Ka,03*016Kg");
    let (mut driver, handle) = open(transport);

    let data = vec![0x55u8; 32];
    memory::do_download(
        &mut driver,
        memory::DownloadRequest {
            start_addr: 0x0800_4000,
            data: &data,
            no_erase: false,
            leave: false,
        },
        |_event| {},
    )
    .expect("download into the writable segment should succeed");

    assert_eq!(handle.set_address_log(), vec![0x0800_4000]);
    assert_eq!(handle.download_log(), vec![(0x0800_4000, data)]);
}
