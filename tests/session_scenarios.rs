//! End-to-end driver behaviour against a scripted device.

use std::thread;

use analog_input_rs::framer::{CURRENT_FIRMWARE, HANDSHAKE_REPLY};
use analog_input_rs::{
    AnalogInput, DriverError, ErrorKind, FirmwareStatus, InputRange, Lifecycle, MockTransport,
    ModuleConfig, StreamDecoder, N_CHANNELS,
};
use rstest::rstest;

/// Acks for the configuration pushed right after the handshake.
const SYNC_ACKS: usize = 8;

fn connected() -> (AnalogInput, MockTransport) {
    let mock = MockTransport::with_handshake(CURRENT_FIRMWARE);
    mock.push_acks(SYNC_ACKS);
    let session = AnalogInput::connect(mock.clone()).expect("connect");
    mock.clear_written();
    (session, mock)
}

fn u16_at(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

#[test]
fn handshake_with_current_firmware_is_silent() {
    let mock = MockTransport::with_handshake(3);
    mock.push_acks(SYNC_ACKS);
    let session = AnalogInput::connect(mock.clone()).unwrap();
    assert_eq!(session.firmware_version(), Some(3));
    assert_eq!(session.firmware_status(), Some(FirmwareStatus::Current));
    assert_eq!(&mock.written()[..2], &[213, b'O']);
}

#[test]
fn old_firmware_is_advisory_only() {
    let mock = MockTransport::with_handshake(2);
    mock.push_acks(SYNC_ACKS + 1);
    let mut session = AnalogInput::connect(mock.clone()).unwrap();
    assert_eq!(
        session.firmware_status(),
        Some(FirmwareStatus::Old { found: 2 })
    );
    assert!(session.is_bound());
    session.set_sampling_rate(500).unwrap();
    assert_eq!(session.state().sampling_rate_hz, 500);
}

#[test]
fn wrong_handshake_reply_is_fatal() {
    let mock = MockTransport::new();
    mock.push_reply(&[HANDSHAKE_REPLY - 1, 3, 0, 0, 0]);
    let err = AnalogInput::connect(mock).err().unwrap();
    assert_eq!(err.kind(), ErrorKind::Handshake);
}

#[test]
fn range_change_carries_max_threshold() {
    let (mut session, mock) = connected();
    mock.push_acks(2);
    session
        .set_channel_range(3, InputRange::Unipolar10V)
        .unwrap();

    let state = session.state();
    assert_eq!(state.channels[3].input_range, InputRange::Unipolar10V);
    assert_eq!(state.channels[3].threshold_volts, 10.0);
    assert_eq!(state.channels[3].reset_volts, 0.0);

    let written = mock.written();
    // [213, 'R', 8 indices] then [213, 'T', 8 thresholds, 8 resets]
    assert_eq!(&written[..2], &[213, b'R']);
    assert_eq!(&written[2..10], &[0, 0, 0, 3, 0, 0, 0, 0]);
    let levels = &written[10..];
    assert_eq!(&levels[..2], &[213, b'T']);
    assert_eq!(levels.len(), 2 + 4 * N_CHANNELS);
    assert_eq!(u16_at(levels, 2 + 2 * 3), 8192);
    // reset snapped to 0 V in a 0-10 V range -> code 0
    assert_eq!(u16_at(levels, 2 + 2 * N_CHANNELS + 2 * 3), 0);
    // untouched channel keeps -10..10 codes
    assert_eq!(u16_at(levels, 2), 8192);
    assert!(session.is_committed());
}

#[test]
fn range_change_clamps_out_of_span_levels() {
    let (mut session, mock) = connected();
    mock.push_acks(3);
    session.set_channel_threshold(5, 7.5).unwrap();
    session.set_channel_range(5, InputRange::Bipolar2V5).unwrap();
    let ch = session.state().channels[5];
    assert_eq!(ch.threshold_volts, 2.5);
    assert_eq!(ch.reset_volts, -2.5);
}

#[test]
fn range_rejection_keeps_everything() {
    let (mut session, mock) = connected();
    mock.push_reply(&[0]);
    let before = session.state().clone();
    let err = session
        .set_input_ranges(&[InputRange::Bipolar5V; N_CHANNELS])
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RejectedByDevice);
    assert_eq!(session.state(), &before);
    assert_eq!(session.lifecycle(), Lifecycle::Bound);
}

#[test]
fn half_applied_range_change_needs_resync() {
    let (mut session, mock) = connected();
    // ranges acked, thresholds rejected
    mock.push_reply(&[1, 0]);
    let before = session.state().clone();
    let err = session
        .set_input_ranges(&[InputRange::Bipolar5V; N_CHANNELS])
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RejectedByDevice);
    assert_eq!(session.state(), &before);
    assert_eq!(session.lifecycle(), Lifecycle::Desynchronized);
}

#[test]
fn out_of_range_threshold_sends_nothing() {
    let (mut session, mock) = connected();
    let mut thresholds = session.state().thresholds();
    thresholds[2] = 12.0;
    match session.set_thresholds(&thresholds).unwrap_err() {
        DriverError::OutOfRange { channel, .. } => assert_eq!(channel, 2),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(mock.write_calls(), 0);
}

#[rstest]
#[case(7)]
#[case(9)]
#[case(0)]
fn wrong_length_arrays_send_nothing(#[case] len: usize) {
    let (mut session, mock) = connected();
    assert_eq!(
        session.set_thresholds(&vec![0.0; len]).unwrap_err().kind(),
        ErrorKind::WrongChannelCount
    );
    assert_eq!(
        session.set_resets(&vec![0.0; len]).unwrap_err().kind(),
        ErrorKind::WrongChannelCount
    );
    assert_eq!(
        session
            .set_input_ranges(&vec![InputRange::Bipolar10V; len])
            .unwrap_err()
            .kind(),
        ErrorKind::WrongChannelCount
    );
    assert_eq!(
        session.set_sm_events(&vec![0; len]).unwrap_err().kind(),
        ErrorKind::WrongChannelCount
    );
    assert_eq!(
        session.set_usb_routing(&vec![1; len]).unwrap_err().kind(),
        ErrorKind::WrongChannelCount
    );
    assert_eq!(mock.write_calls(), 0);
}

#[rstest]
#[case(2)]
#[case(3)]
#[case(255)]
fn unexpected_ack_byte(#[case] reply: u8) {
    let (mut session, mock) = connected();
    mock.push_reply(&[reply]);
    let err = session.set_n_active_channels(2).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NoAcknowledgment);
    assert_eq!(session.state().n_active_channels, 8);
}

#[test]
fn rejected_ack_leaves_value() {
    let (mut session, mock) = connected();
    mock.push_reply(&[0]);
    let err = session.set_sampling_rate(4000).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RejectedByDevice);
    assert_eq!(session.state().sampling_rate_hz, 1000);
}

#[rstest]
#[case(0)]
#[case(10_001)]
fn sampling_rate_bounds(#[case] hz: u32) {
    let (mut session, mock) = connected();
    assert_eq!(
        session.set_sampling_rate(hz).unwrap_err().kind(),
        ErrorKind::InvalidRange
    );
    assert_eq!(mock.write_calls(), 0);
}

#[test]
fn channel_index_is_checked() {
    let (mut session, mock) = connected();
    assert_eq!(
        session.set_channel_threshold(8, 0.0).unwrap_err().kind(),
        ErrorKind::InvalidChannel
    );
    assert_eq!(
        session
            .set_channel_range(12, InputRange::Bipolar5V)
            .unwrap_err()
            .kind(),
        ErrorKind::InvalidChannel
    );
    assert_eq!(mock.write_calls(), 0);
}

#[test]
fn unknown_range_name() {
    let (mut session, mock) = connected();
    let mut names = vec!["-10V:10V"; N_CHANNELS];
    names[4] = "-1V:1V";
    assert_eq!(
        session.set_input_range_names(&names).unwrap_err().kind(),
        ErrorKind::UnknownRange
    );
    assert_eq!(mock.write_calls(), 0);
}

#[test]
fn repeated_setter_is_stable() {
    let (mut session, mock) = connected();
    mock.push_acks(2);
    session.set_stream_prefix(b'#').unwrap();
    let once = session.state().clone();
    session.set_stream_prefix(b'#').unwrap();
    assert_eq!(session.state(), &once);
    assert_eq!(mock.write_calls(), 2);
    assert_eq!(mock.written(), vec![213, b'P', b'#', 213, b'P', b'#']);
}

#[test]
fn sync_prefix_frame_is_passed_through() {
    let (mut session, mock) = connected();
    mock.push_acks(2);
    session.set_n_active_channels(2).unwrap();
    session.start_usb_stream().unwrap();

    mock.push_reply(&[35, 4, 100, 0, 200, 0]);
    let frame = session.read_stream_frame().unwrap();
    assert_eq!(frame.prefix_pair(), (35, 4));
    assert_eq!(frame.samples, vec![100, 200]);

    mock.push_reply(&[b'R', 0, 1]);
    assert_eq!(
        session.read_stream_frame().unwrap_err().kind(),
        ErrorKind::Decode
    );
}

#[test]
fn streamed_channel_count_follows_routing() {
    let (mut session, mock) = connected();
    mock.push_acks(3);
    session.set_n_active_channels(4).unwrap();
    session.set_channel_usb_stream(1, false).unwrap();
    session.start_usb_stream().unwrap();
    assert_eq!(session.streamed_ranges().len(), 3);

    let mut decoder = StreamDecoder::new(3);
    mock.push_reply(&[b'R', 0, 0, 0, 0, 0x10, 0, 0x20]);
    let frame = session.read_stream_frame().unwrap();
    assert_eq!(frame, decoder.decode_frame(&[b'R', 0, 0, 0, 0, 0x10, 0, 0x20]).unwrap());
    assert_eq!(session.frame_volts(&frame), vec![-10.0, 0.0, 10.0]);
}

#[test]
fn config_round_trips_through_setters() {
    let (mut session, mock) = connected();
    let mut config = ModuleConfig::default();
    config.n_active_channels = 3;
    config.sampling_rate_hz = 2500;
    config.input_ranges[0] = InputRange::Bipolar5V;
    config.thresholds[0] = 1.5;
    config.resets[0] = -0.5;
    config.sm_events[0] = true;
    config.stream_prefix = b'#';

    // 9 acked commands; the range change costs two
    mock.push_acks(10);
    session.apply_config(&config).unwrap();
    assert_eq!(session.config(), config);
    assert_eq!(mock.pending_replies(), 0);
}

#[test]
fn shared_session_serializes_callers() {
    let (session, mock) = connected();
    mock.push_acks(4);
    let shared = session.into_shared();
    let handles: Vec<_> = (0..4u32)
        .map(|i| {
            let shared = shared.clone();
            thread::spawn(move || {
                let mut ai = shared.lock().unwrap();
                ai.set_sampling_rate(100 * (i + 1)).unwrap();
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    let written = mock.written();
    assert_eq!(written.len(), 4 * 6);
    for frame in written.chunks(6) {
        assert_eq!(&frame[..2], &[213, b'F']);
    }
}

#[test]
fn zero_expects_no_reply() {
    let (mut session, mock) = connected();
    session.zero().unwrap();
    assert_eq!(mock.written(), vec![213, b'Z']);
    assert!(session.is_bound());
}
