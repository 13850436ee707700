//! VIF and binding lifecycle: two-phase stop, power transitions, status
//! fan-out and unbind.

mod harness;

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use mvirt_mux::lower::{DevicePowerState, LowerError, MediaStatus};
use mvirt_mux::test_util::RecordingHandler;
use mvirt_mux::{
    Completion, FrameCookie, MacAddr, MuxError, Oid, OutboundFrame, PacketFilter, Request,
    RequestStatus, Vif, VifDefinition, VifState,
};

use harness::{active_vif, frame_from, frame_to, setup, wait_for};

fn set_vif_power(vif: &Arc<Vif>, state: DevicePowerState) {
    let status = vif
        .set_information(
            Oid::PNP_SET_POWER,
            &(state as u32).to_le_bytes(),
            Completion::Discard,
        )
        .unwrap();
    assert!(status.is_complete());
}

#[test]
fn test_stop_waits_for_outstanding_sends() {
    let s = setup();
    let h = RecordingHandler::new();
    let vif = active_vif(&s.binding, "vif1", h.clone());
    s.stub.set_auto_complete(false);

    let frames = vec![
        OutboundFrame::new(frame_from(&vif, &[1; 46]), FrameCookie(1)),
        OutboundFrame::new(frame_from(&vif, &[2; 46]), FrameCookie(2)),
    ];
    vif.send_frames(frames).unwrap();

    let stopper = {
        let vif = Arc::clone(&vif);
        thread::spawn(move || vif.halt())
    };
    thread::sleep(Duration::from_millis(50));
    assert!(!stopper.is_finished());
    assert_eq!(vif.state(), VifState::Halting);
    assert_eq!(s.binding.vif_count(), 1);

    assert_eq!(s.stub.complete_frames(Ok(())), 2);
    stopper.join().unwrap();

    assert_eq!(vif.state(), VifState::Destroyed);
    assert_eq!(h.successful_completions(), 2);
    assert_eq!(vif.sends_in_flight(), 0);
    assert_eq!(s.binding.vif_count(), 0);
}

#[test]
fn test_stop_waits_for_held_frames() {
    let s = setup();
    let h = RecordingHandler::new();
    let vif = active_vif(&s.binding, "vif1", h.clone());
    assert_eq!(s.binding.indicate_frame(&frame_to(&vif, &[0; 46])), 1);
    assert_eq!(h.held_count(), 1);

    let stopper = {
        let vif = Arc::clone(&vif);
        thread::spawn(move || vif.halt())
    };
    thread::sleep(Duration::from_millis(50));
    assert!(!stopper.is_finished());

    // Halting VIFs receive nothing new.
    assert_eq!(s.binding.indicate_frame(&frame_to(&vif, &[0; 46])), 0);

    h.return_frames();
    stopper.join().unwrap();
    assert_eq!(vif.state(), VifState::Destroyed);
    assert_eq!(vif.receive_queue_len(), 0);
}

#[test]
fn test_dropped_sends_complete_aborted() {
    let s = setup();
    let h = RecordingHandler::new();
    let vif = active_vif(&s.binding, "vif1", h.clone());
    s.stub.set_auto_complete(false);

    vif.send_frames(vec![OutboundFrame::new(
        frame_from(&vif, &[0; 46]),
        FrameCookie(5),
    )])
    .unwrap();
    assert_eq!(s.stub.drop_frames(), 1);

    let completions = h.completions();
    assert_eq!(completions.len(), 1);
    assert_eq!(completions[0].1, FrameCookie(5));
    assert_eq!(completions[0].2, Err(MuxError::Lower(LowerError::Aborted)));
    assert_eq!(vif.sends_in_flight(), 0);
}

#[test]
fn test_concurrent_stops_both_return_after_drain() {
    let s = setup();
    let vif = active_vif(&s.binding, "vif1", RecordingHandler::new());
    s.stub.set_auto_complete(false);
    vif.send_frames(vec![OutboundFrame::new(
        frame_from(&vif, &[0; 46]),
        FrameCookie(1),
    )])
    .unwrap();

    let stoppers: Vec<_> = (0..2)
        .map(|_| {
            let vif = Arc::clone(&vif);
            thread::spawn(move || vif.halt())
        })
        .collect();
    thread::sleep(Duration::from_millis(50));
    assert!(stoppers.iter().all(|t| !t.is_finished()));

    s.stub.complete_frames(Ok(()));
    for stopper in stoppers {
        stopper.join().unwrap();
    }
    assert_eq!(vif.state(), VifState::Destroyed);
}

#[test]
fn test_operations_rejected_after_halt() {
    let s = setup();
    let vif = active_vif(&s.binding, "vif1", RecordingHandler::new());
    vif.halt();

    let id = vif.id();
    assert_eq!(
        vif.send_frames(vec![OutboundFrame::new(vec![0; 60], FrameCookie(0))]),
        Err(MuxError::Halting(id))
    );
    assert_eq!(
        vif.set_packet_filter(PacketFilter::DIRECTED),
        Err(MuxError::Halting(id))
    );
    assert_eq!(
        vif.forward_request(Request::query(Oid::GEN_LINK_SPEED, 4), Completion::Discard),
        Err(MuxError::Halting(id))
    );
    assert_eq!(
        vif.query_information(Oid::ETH_CURRENT_ADDRESS, 6, Completion::Discard),
        Err(MuxError::Halting(id))
    );
    assert_eq!(
        vif.initialize(RecordingHandler::new()),
        Err(MuxError::InvalidState(id, VifState::Destroyed))
    );

    // Halting again returns at once.
    vif.halt();
}

#[test]
fn test_halt_uninitialized_vif() {
    let s = setup();
    let vif = s.binding.create_vif(&VifDefinition::new("vif1")).unwrap();
    assert_eq!(s.binding.ref_count(), 2);

    vif.halt();
    assert_eq!(vif.state(), VifState::Destroyed);
    assert_eq!(s.binding.vif_count(), 0);
    assert_eq!(s.binding.ref_count(), 1);
}

/// The lower filter is switched on by the first non-empty VIF filter and
/// off again by the last one going empty.
#[test]
fn test_lower_filter_follows_union() {
    let s = setup();
    let vif1 = s.binding.create_vif(&VifDefinition::new("vif1")).unwrap();
    let vif2 = s.binding.create_vif(&VifDefinition::new("vif2")).unwrap();
    vif1.initialize(RecordingHandler::new()).unwrap();
    vif2.initialize(RecordingHandler::new()).unwrap();

    let pushes = || s.stub.requests_for(Oid::GEN_CURRENT_PACKET_FILTER);
    assert!(pushes().is_empty());
    assert_eq!(s.binding.indicate_frame(&frame_to(&vif1, &[0; 46])), 0);

    vif1.set_packet_filter(PacketFilter::DIRECTED).unwrap();
    assert_eq!(
        pushes(),
        vec![Request::set_u32(Oid::GEN_CURRENT_PACKET_FILTER, 0x20)]
    );

    vif2.set_packet_filter(PacketFilter::BROADCAST).unwrap();
    assert_eq!(pushes().len(), 1);
    assert_eq!(
        s.binding.packet_filter(),
        PacketFilter::DIRECTED | PacketFilter::BROADCAST
    );

    vif1.set_packet_filter(PacketFilter::empty()).unwrap();
    assert_eq!(pushes().len(), 1);
    assert_eq!(s.binding.packet_filter(), PacketFilter::BROADCAST);

    vif2.set_packet_filter(PacketFilter::empty()).unwrap();
    let pushes = pushes();
    assert_eq!(pushes.len(), 2);
    assert_eq!(pushes[1], Request::set_u32(Oid::GEN_CURRENT_PACKET_FILTER, 0));
    assert!(s.binding.packet_filter().is_empty());
}

#[test]
fn test_stopping_last_filtered_vif_clears_lower_filter() {
    let s = setup();
    let vif = active_vif(&s.binding, "vif1", RecordingHandler::new());
    vif.halt();

    let pushes = s.stub.requests_for(Oid::GEN_CURRENT_PACKET_FILTER);
    assert_eq!(
        pushes.last(),
        Some(&Request::set_u32(Oid::GEN_CURRENT_PACKET_FILTER, 0))
    );
    assert!(s.binding.packet_filter().is_empty());
}

#[test]
fn test_bootstrap_reports_each_definition() {
    let s = setup();
    s.binding.create_vif(&VifDefinition::new("existing")).unwrap();

    let report = s.binding.bootstrap_vifs(&[
        VifDefinition::new("a"),
        VifDefinition::new("b").station_address(MacAddr([0x01, 0, 0x5e, 0, 0, 1])),
        VifDefinition::new("existing"),
        VifDefinition::new("c").vlan_id(7),
    ]);

    let created: Vec<_> = report.created.iter().map(|v| v.device_key()).collect();
    assert_eq!(created, vec!["a", "c"]);
    assert_eq!(report.skipped, vec!["existing".to_string()]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "b");
    assert!(matches!(report.failed[0].1, MuxError::InvalidAddress(_)));

    assert_eq!(s.binding.vif_count(), 3);
    assert_eq!(s.binding.find_vif("c").unwrap().vlan_id(), 7);
    assert!(report.created.iter().all(|v| v.state() == VifState::Created));

    // VIF numbers are unique and increasing.
    let ids: Vec<_> = s.binding.vifs().iter().map(|v| v.id()).collect();
    assert!(ids.windows(2).all(|w| w[0] < w[1]));
}

/// Requests issued while the binding is in low power are parked and
/// submitted on the return to D0.
#[test]
fn test_low_power_binding_queues_requests() {
    let s = setup();
    let vif = active_vif(&s.binding, "vif1", RecordingHandler::new());

    s.binding.set_power(DevicePowerState::D3);
    assert_eq!(s.binding.power_state(), DevicePowerState::D3);

    let (completion, rx) = Completion::channel();
    assert_eq!(
        vif.forward_request(Request::query(Oid::GEN_LINK_SPEED, 4), completion),
        Ok(RequestStatus::Queued)
    );
    assert!(s.stub.requests_for(Oid::GEN_LINK_SPEED).is_empty());
    assert_eq!(
        vif.forward_request(Request::query(Oid::GEN_LINK_SPEED, 4), Completion::Discard),
        Err(MuxError::RequestPending(vif.id()))
    );
    assert!(rx.try_recv().is_err());

    s.binding.set_power(DevicePowerState::D0);
    let outcome = rx.recv_timeout(Duration::from_secs(1)).unwrap().unwrap();
    assert_eq!(outcome.as_u32(), Some(100_000));
    assert_eq!(s.stub.requests_for(Oid::GEN_LINK_SPEED).len(), 1);

    assert_eq!(
        vif.forward_request(Request::query(Oid::GEN_LINK_SPEED, 4), Completion::Discard),
        Ok(RequestStatus::Pending)
    );
}

#[test]
fn test_stop_fails_queued_request() {
    let s = setup();
    let vif = active_vif(&s.binding, "vif1", RecordingHandler::new());
    s.binding.set_power(DevicePowerState::D3);

    let (completion, rx) = Completion::channel();
    assert_eq!(
        vif.forward_request(Request::query(Oid::GEN_LINK_SPEED, 4), completion),
        Ok(RequestStatus::Queued)
    );

    vif.halt();
    assert_eq!(rx.recv().unwrap(), Err(MuxError::Halting(vif.id())));
    assert_eq!(vif.state(), VifState::Destroyed);

    // Nothing left to replay.
    s.binding.set_power(DevicePowerState::D0);
    assert!(s.stub.requests_for(Oid::GEN_LINK_SPEED).is_empty());
}

#[test]
fn test_low_power_vif() {
    let s = setup();
    let h = RecordingHandler::returning();
    let vif = active_vif(&s.binding, "vif1", h.clone());

    set_vif_power(&vif, DevicePowerState::D3);
    assert_eq!(vif.power_state(), DevicePowerState::D3);
    assert_eq!(
        vif.forward_request(Request::query(Oid::GEN_LINK_SPEED, 4), Completion::Discard),
        Err(MuxError::AdapterNotReady)
    );
    assert_eq!(s.binding.indicate_frame(&frame_to(&vif, &[0; 46])), 0);
    assert_eq!(h.indication_count(), 0);

    set_vif_power(&vif, DevicePowerState::D0);
    assert_eq!(s.binding.indicate_frame(&frame_to(&vif, &[0; 46])), 1);
    assert_eq!(
        vif.forward_request(Request::query(Oid::GEN_LINK_SPEED, 4), Completion::Discard),
        Ok(RequestStatus::Pending)
    );
}

/// Status reaches every VIF; a VIF in low power gets the latest status it
/// missed when it returns to D0.
#[test]
fn test_status_fan_out_and_replay() {
    let s = setup();
    let h1 = RecordingHandler::new();
    let h2 = RecordingHandler::new();
    let vif1 = active_vif(&s.binding, "vif1", h1.clone());
    let vif2 = active_vif(&s.binding, "vif2", h2.clone());

    s.binding.indicate_status(MediaStatus::Disconnected);
    assert_eq!(h1.statuses(), vec![(vif1.id(), MediaStatus::Disconnected)]);
    assert_eq!(h2.statuses(), vec![(vif2.id(), MediaStatus::Disconnected)]);

    set_vif_power(&vif1, DevicePowerState::D2);
    s.binding.indicate_status(MediaStatus::Connected);
    assert_eq!(h1.statuses().len(), 1);
    assert_eq!(h2.statuses().len(), 2);

    set_vif_power(&vif1, DevicePowerState::D0);
    assert_eq!(
        h1.statuses(),
        vec![
            (vif1.id(), MediaStatus::Disconnected),
            (vif1.id(), MediaStatus::Connected)
        ]
    );
}

/// No replay when the status did not change while in low power.
#[test]
fn test_status_not_replayed_when_unchanged() {
    let s = setup();
    let h = RecordingHandler::new();
    let vif = active_vif(&s.binding, "vif1", h.clone());

    s.binding.indicate_status(MediaStatus::Connected);
    set_vif_power(&vif, DevicePowerState::D3);
    s.binding.indicate_status(MediaStatus::Disconnected);
    s.binding.indicate_status(MediaStatus::Connected);
    set_vif_power(&vif, DevicePowerState::D0);

    assert_eq!(h.statuses(), vec![(vif.id(), MediaStatus::Connected)]);
}

/// Exactly one of many concurrent requests on a VIF is admitted.
#[test]
fn test_concurrent_requests_admit_one() {
    let s = setup();
    let vif = active_vif(&s.binding, "vif1", RecordingHandler::new());
    s.stub.set_auto_complete(false);

    let barrier = Arc::new(Barrier::new(8));
    let workers: Vec<_> = (0..8)
        .map(|_| {
            let vif = Arc::clone(&vif);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                vif.forward_request(Request::query(Oid::GEN_LINK_SPEED, 4), Completion::Discard)
            })
        })
        .collect();
    let results: Vec<_> = workers.into_iter().map(|t| t.join().unwrap()).collect();

    let admitted = results
        .iter()
        .filter(|r| **r == Ok(RequestStatus::Pending))
        .count();
    let rejected = results
        .iter()
        .filter(|r| **r == Err(MuxError::RequestPending(vif.id())))
        .count();
    assert_eq!(admitted, 1);
    assert_eq!(rejected, 7);
    assert_eq!(s.stub.held_request_count(), 1);

    s.stub.complete_next_request();
    assert_eq!(
        vif.forward_request(Request::query(Oid::GEN_LINK_SPEED, 4), Completion::Discard),
        Ok(RequestStatus::Pending)
    );
}

#[test]
fn test_unbind_stops_every_vif() {
    let s = setup();
    let h1 = RecordingHandler::new();
    let vif1 = active_vif(&s.binding, "vif1", h1.clone());
    let vif2 = active_vif(&s.binding, "vif2", RecordingHandler::new());
    let idle = s.binding.create_vif(&VifDefinition::new("idle")).unwrap();
    assert_eq!(s.binding.indicate_frame(&frame_to(&vif1, &[0; 46])), 1);

    let unbinder = {
        let binding = Arc::clone(&s.binding);
        thread::spawn(move || binding.unbind())
    };
    thread::sleep(Duration::from_millis(50));
    assert!(!unbinder.is_finished());
    assert!(s.binding.is_closing());
    assert!(matches!(
        s.binding.create_vif(&VifDefinition::new("late")),
        Err(MuxError::BindingClosing)
    ));

    h1.return_frames();
    unbinder.join().unwrap();

    for vif in [&vif1, &vif2, &idle] {
        assert_eq!(vif.state(), VifState::Destroyed);
    }
    assert!(s.binding.is_destroyed());
    assert_eq!(s.binding.ref_count(), 0);
    assert!(s.registry.is_empty());
    assert!(s.stub.is_closed());
    assert!(s.binding.pin().is_none());
    assert_eq!(s.binding.indicate_frame(&frame_to(&vif2, &[0; 46])), 0);
}

/// VIFs created while the binding unbinds are either stopped with it or
/// refused. Unbind always finishes.
#[test]
fn test_create_vif_racing_unbind() {
    for round in 0..200 {
        let s = setup();
        let barrier = Arc::new(Barrier::new(2));

        let creator = {
            let binding = Arc::clone(&s.binding);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                (0..4)
                    .filter_map(|i| binding.create_vif(&VifDefinition::new(format!("v{i}"))).ok())
                    .collect::<Vec<_>>()
            })
        };
        let unbinder = {
            let binding = Arc::clone(&s.binding);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                binding.unbind();
            })
        };

        assert!(
            wait_for(|| unbinder.is_finished()),
            "round {round}: unbind did not finish, {} VIFs linked",
            s.binding.vif_count()
        );
        unbinder.join().unwrap();
        for vif in creator.join().unwrap() {
            assert_eq!(vif.state(), VifState::Destroyed);
        }
        assert!(s.binding.is_destroyed());
        assert_eq!(s.binding.vif_count(), 0);
        assert_eq!(s.binding.ref_count(), 0);
        assert!(s.stub.is_closed());
    }
}

/// A second unbind returns only after the first has destroyed the binding.
#[test]
fn test_second_unbind_waits_for_destroy() {
    let s = setup();
    active_vif(&s.binding, "vif1", RecordingHandler::new());
    let pinned = s.binding.pin().unwrap();

    let first = {
        let binding = Arc::clone(&s.binding);
        thread::spawn(move || binding.unbind())
    };
    assert!(wait_for(|| s.binding.is_closing()));

    let second = {
        let binding = Arc::clone(&s.binding);
        let registry = Arc::clone(&s.registry);
        let stub = s.stub.clone();
        thread::spawn(move || {
            binding.unbind();
            (binding.is_destroyed(), registry.is_empty(), stub.is_closed())
        })
    };
    thread::sleep(Duration::from_millis(50));
    assert!(!second.is_finished());

    drop(pinned);
    assert_eq!(second.join().unwrap(), (true, true, true));
    first.join().unwrap();
}

#[test]
fn test_returned_frame_releases_vif() {
    let s = setup();
    let h = RecordingHandler::returning();
    let vif = active_vif(&s.binding, "vif1", h.clone());

    let frame = frame_to(&vif, &[3; 46]);
    s.binding.indicate_frame(&frame);
    assert_eq!(h.indications()[0].data, frame);
    assert_eq!(h.indications()[0].tag, None);
    assert_eq!(vif.receive_queue_len(), 0);
    assert_eq!(vif.in_flight(), 0);
}
