use uom::si::electric_potential::millivolt;

use super::*;
use crate::config::{PortConfig, PortType};
use crate::dpm::NoVdm;
use crate::dummy::{DummyClock, DummyDevice, DummyDriver, EventLog, TxBehaviour};
use crate::protocol_layer::ProtocolState;
use crate::protocol_layer::message::data::request::{self, RawDataObject};
use crate::protocol_layer::message::data::source_capabilities::{FixedSupply, SourceCapabilities};
use crate::protocol_layer::message::extended::ExtendedHeader;
use crate::protocol_layer::message::extended::chunked::ChunkedMessageAssembler;

type TestPort = Port<DummyDriver, DummyClock, DummyDevice, EventLog, NoVdm>;

struct Harness {
    port: TestPort,
    clock: DummyClock,
    events: EventLog,
}

impl Harness {
    fn new(config: PortConfig) -> Self {
        let clock = DummyClock::default();
        let events = EventLog::default();
        let port = Port::new(
            config,
            DummyDriver::new(),
            clock.clone(),
            DummyDevice::default(),
            events.clone(),
            NoVdm,
        );
        Self { port, clock, events }
    }

    fn source(config: PortConfig) -> Self {
        let mut harness = Self::new(PortConfig {
            port_type: PortType::Drp,
            ..config
        });
        harness.port.enable(PowerRole::Source).unwrap();
        harness
    }

    fn sink(config: PortConfig) -> Self {
        let mut harness = Self::new(config);
        harness.port.enable(PowerRole::Sink).unwrap();
        harness
    }

    fn run(&mut self) {
        self.port.run().unwrap();
    }

    /// Run until the state matches, without advancing the clock.
    fn run_until(&mut self, reached: impl Fn(PolicyState) -> bool) {
        for _ in 0..32 {
            if reached(self.port.state()) {
                return;
            }
            self.run();
        }
        panic!("stuck in {:?}", self.port.state());
    }

    fn driver(&mut self) -> &mut DummyDriver {
        self.port.driver_mut()
    }

    fn last_sent(&self) -> Message {
        self.port.driver().last_message().expect("nothing transmitted")
    }

    fn inject_data(&mut self, role: PowerRole, data: Data) {
        let message_type = data.message_type().unwrap();
        let header = Header::new_data(DummyDriver::partner_template(role), message_type, 0);
        self.driver().inject(Message::new_with_data(header, data));
    }

    /// Bring a source up to the point where it waits for a request.
    fn source_caps_sent(&mut self) {
        self.run_until(|state| state == PolicyState::SourceStartup(StartupStep::SwitchDelay));
        self.clock.advance(TimerType::VBusSwitchDelay.duration_ms());
        self.run_until(|state| state == PolicyState::SourceSendCaps(Exchange::AwaitResponse));
    }

    /// Negotiate a contract as source, for the given request.
    fn source_contract(&mut self, rdo: RawDataObject) {
        self.source_caps_sent();
        self.inject_data(PowerRole::Sink, Data::Request(rdo));
        self.run_until(|state| state == PolicyState::SourceTransitionSupply(TransitionSupplyStep::WaitTransition));
        self.clock.advance(TimerType::SrcTransition.duration_ms());
        self.run_until(|state| state == PolicyState::SourceReady);
    }

    /// Negotiate a contract as sink, against a 5 V/3 A and 9 V/3 A source.
    fn sink_contract(&mut self) {
        self.run_until(|state| state == PolicyState::SinkWaitCaps);
        self.inject_data(PowerRole::Source, Data::SourceCapabilities(partner_caps()));
        self.run_until(|state| state == PolicyState::SinkSelectCapability(Exchange::AwaitResponse));
        self.driver().inject_control(PowerRole::Source, ControlMessageType::Accept);
        self.run_until(|state| state == PolicyState::SinkTransitionSink);
        self.driver().inject_control(PowerRole::Source, ControlMessageType::PsRdy);
        self.run_until(|state| state == PolicyState::SinkReady);
    }
}

fn partner_caps() -> SourceCapabilities {
    let mut caps = SourceCapabilities::default();
    caps.0
        .push(PowerDataObject::FixedSupply(FixedSupply::new(100, 300)))
        .unwrap();
    caps.0
        .push(PowerDataObject::FixedSupply(FixedSupply::new(180, 300)))
        .unwrap();
    caps
}

fn fixed_request(position: u8, current: u16) -> RawDataObject {
    RawDataObject(
        request::FixedVariableSupply::default()
            .with_object_position(position)
            .with_raw_operating_current(current)
            .with_raw_max_operating_current(current)
            .0,
    )
}

fn is_control(message: &Message, message_type: ControlMessageType) -> bool {
    message.header.is_control(message_type)
}

#[test]
fn new_port_is_idle() {
    let harness = Harness::new(PortConfig::default());

    assert_eq!(harness.port.state(), PolicyState::Disabled);
    assert_eq!(harness.port.protocol_state(), ProtocolState::Disabled);
    assert_eq!(harness.port.next_timeout(), 0);
    assert!(!harness.port.has_contract());
    assert_eq!(harness.port.detach_threshold().get::<millivolt>(), 3670);
}

#[test]
fn source_grants_fixed_request() {
    let mut harness = Harness::source(PortConfig::default());
    harness.source_caps_sent();

    let Some(Data::SourceCapabilities(caps)) = harness.last_sent().data().cloned() else {
        panic!("expected source capabilities");
    };
    assert_eq!(caps.num_objects(), 3);

    let rdo = fixed_request(1, 200);
    harness.inject_data(PowerRole::Sink, Data::Request(rdo));
    harness.run_until(|state| state == PolicyState::SourceTransitionSupply(TransitionSupplyStep::WaitTransition));
    assert!(is_control(&harness.last_sent(), ControlMessageType::Accept));

    harness.clock.advance(TimerType::SrcTransition.duration_ms());
    harness.run_until(|state| state == PolicyState::SourceReady);

    assert!(is_control(&harness.last_sent(), ControlMessageType::PsRdy));
    assert!(harness.port.has_contract());
    assert_eq!(harness.port.contract(), Some(rdo));
    assert_eq!(harness.port.dpm().transitions, [0]);

    let notifications = harness.events.0.borrow();
    let contract = notifications
        .iter()
        .find(|notification| notification.event == Event::NewContract)
        .expect("no contract notification");
    assert_eq!(contract.payload, EventPayload::Contract(rdo.0));
}

#[test]
fn source_rejects_request_outside_pps_range() {
    let mut harness = Harness::source(PortConfig::default());
    harness.source_caps_sent();

    // 12 V from a 3.3-11 V supply
    let rdo = RawDataObject(
        request::Pps::default()
            .with_object_position(3)
            .with_raw_output_voltage(600)
            .with_raw_operating_current(40)
            .0,
    );
    harness.inject_data(PowerRole::Sink, Data::Request(rdo));
    harness.run_until(|state| state == PolicyState::SourceWaitNewCapabilities);

    assert!(is_control(&harness.last_sent(), ControlMessageType::Reject));
    assert!(!harness.port.has_contract());
}

#[test]
fn source_grants_pps_request() {
    let mut harness = Harness::source(PortConfig::default());

    // 5 V at 2 A
    let rdo = RawDataObject(
        request::Pps::default()
            .with_object_position(3)
            .with_raw_output_voltage(250)
            .with_raw_operating_current(40)
            .0,
    );
    harness.source_contract(rdo);

    assert!(harness.port.has_contract());
    assert!(harness.port.pps_enabled);
    assert!(!harness.port.pps_timer.disabled());
}

#[test]
fn sink_negotiates_contract() {
    let mut harness = Harness::sink(PortConfig::default());
    harness.sink_contract();

    let requests: std::vec::Vec<_> = harness
        .port
        .driver()
        .messages()
        .into_iter()
        .filter_map(|message| match message.data() {
            Some(Data::Request(rdo)) => Some(request::FixedVariableSupply(rdo.0)),
            _ => None,
        })
        .collect();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].object_position(), 1);
    assert_eq!(requests[0].raw_operating_current(), 300);
    assert!(!requests[0].capability_mismatch());

    assert!(harness.port.has_contract());
    assert_eq!(harness.port.detach_threshold().get::<millivolt>(), 3670);
    assert!(harness.events.events().contains(&Event::NewContract));
}

#[test]
fn sink_hard_resets_without_source_caps() {
    let mut harness = Harness::sink(PortConfig::default());
    harness.run_until(|state| state == PolicyState::SinkWaitCaps);

    harness.clock.advance(TimerType::TypeCSinkWaitCap.duration_ms());
    harness.run_until(|state| matches!(state, PolicyState::SinkTransitionDefault(_)));

    assert_eq!(harness.port.driver().hard_resets, 1);
    assert_eq!(harness.port.hard_reset_counter.value(), 1);
}

#[test]
fn hard_reset_clears_contract() {
    let mut harness = Harness::sink(PortConfig::default());
    harness.sink_contract();
    assert!(harness.port.has_contract());

    harness.driver().inject_hard_reset();
    harness.run();

    // Roles and contract are reset within the same run.
    assert_eq!(
        harness.port.state(),
        PolicyState::SinkTransitionDefault(SinkDefaultStep::WaitVbusOff)
    );
    assert!(!harness.port.has_contract());
    assert_eq!(harness.port.contract(), None);
    assert_eq!(harness.port.detach_threshold().get::<millivolt>(), 3670);
    assert!(harness.events.events().contains(&Event::NoContract));

    // The source cycles VBUS.
    harness.run();
    assert_eq!(
        harness.port.state(),
        PolicyState::SinkTransitionDefault(SinkDefaultStep::WaitVbusOff)
    );
    harness.driver().vbus_vsafe5v = false;
    harness.driver().vbus_vsafe0v = true;
    harness.run();
    harness.driver().vbus_vsafe0v = false;
    harness.driver().vbus_vsafe5v = true;
    harness.run_until(|state| state == PolicyState::SinkWaitCaps);
}

#[test]
fn collisions_end_in_hard_reset() {
    let mut harness = Harness::source(PortConfig::default());
    harness.run_until(|state| state == PolicyState::SourceStartup(StartupStep::SwitchDelay));
    harness.driver().behaviour = TxBehaviour::Collision;
    harness.clock.advance(TimerType::VBusSwitchDelay.duration_ms());

    harness.run_until(|state| matches!(state, PolicyState::SourceTransitionDefault(_)));

    // The first attempt and three retries after collisions.
    assert_eq!(harness.port.driver().transmit_count, 4);
    assert_eq!(harness.port.driver().hard_resets, 1);
}

#[test]
fn country_codes_are_sent_in_chunks() {
    let mut harness = Harness::source(PortConfig::default());
    harness.source_contract(fixed_request(1, 200));
    let sent_before = harness.port.driver().transmitted.len();

    harness
        .driver()
        .inject_control(PowerRole::Sink, ControlMessageType::GetCountryCodes);
    harness.run_until(|state| state == PolicyState::GiveCountryCodes);
    for _ in 0..4 {
        harness.run();
    }

    // The first chunk is out, the port waits for the request of the second.
    assert_eq!(harness.port.state(), PolicyState::GiveCountryCodes);
    let frame = harness.port.driver().transmitted[sent_before].clone();
    let header = DummyDriver::parse_frame(&frame).header;
    assert!(header.extended());
    assert_eq!(header.num_objects(), 7);
    let ext_header = ExtendedHeader::from_bytes(DummyDriver::frame_payload(&frame)).unwrap();
    assert_eq!(ext_header.data_size(), 40);
    assert_eq!(ext_header.chunk_number(), 0);

    let id = harness.driver().next_rx_id();
    let request = Header::new_extended(
        DummyDriver::partner_template(PowerRole::Sink),
        ExtendedMessageType::CountryCodes,
    )
    .with_num_objects(1)
    .with_message_id(id);
    let mut payload = [0u8; 4];
    ChunkedMessageAssembler::build_chunk_request_header(1).to_bytes(&mut payload);
    harness.driver().inject_raw(Sop::Sop, request, &payload);

    harness.run_until(|state| state == PolicyState::SourceReady);

    let transmitted = &harness.port.driver().transmitted;
    assert_eq!(transmitted.len(), sent_before + 2);
    let frame = &transmitted[sent_before + 1];
    assert_eq!(DummyDriver::parse_frame(frame).header.num_objects(), 4);
    let ext_header = ExtendedHeader::from_bytes(DummyDriver::frame_payload(frame)).unwrap();
    assert_eq!(ext_header.chunk_number(), 1);
}

#[test]
fn unsupported_message_is_not_supported() {
    let mut harness = Harness::source(PortConfig::default());
    harness.source_contract(fixed_request(1, 200));

    harness
        .driver()
        .inject_control(PowerRole::Sink, ControlMessageType::GetStatus);
    harness.run_until(|state| state == PolicyState::NotSupported);
    harness.run_until(|state| state == PolicyState::SourceReady);

    assert!(is_control(&harness.last_sent(), ControlMessageType::NotSupported));
}

#[test]
fn unsupported_message_is_rejected_by_revision_2() {
    let mut harness = Harness::source(PortConfig {
        spec_revision: SpecificationRevision::R2_0,
        ..Default::default()
    });
    harness.source_contract(fixed_request(1, 200));

    harness
        .driver()
        .inject_control(PowerRole::Sink, ControlMessageType::GetStatus);
    harness.run_until(|state| state == PolicyState::NotSupported);
    harness.run_until(|state| state == PolicyState::SourceReady);

    let response = harness.last_sent();
    assert!(is_control(&response, ControlMessageType::Reject));
    assert!(matches!(response.header.spec_revision(), Ok(SpecificationRevision::R2_0)));
}

#[test]
fn silent_partner_ends_data_role_swap() {
    let mut harness = Harness::source(PortConfig::default());
    harness.source_contract(fixed_request(1, 200));

    harness.port.request_transmit(ControlMessageType::DrSwap).unwrap();
    harness.run_until(|state| state == PolicyState::SourceSendDrSwap(Exchange::AwaitResponse));
    assert!(is_control(&harness.last_sent(), ControlMessageType::DrSwap));

    harness.clock.advance(TimerType::SenderResponse.duration_ms());
    harness.run_until(|state| state == PolicyState::SourceReady);
    assert_eq!(harness.port.data_role(), DataRole::Dfp);
    assert_eq!(harness.port.driver().hard_resets, 0);
}

#[test]
fn accepted_data_role_swap() {
    let mut harness = Harness::source(PortConfig::default());
    harness.source_contract(fixed_request(1, 200));

    harness.port.request_transmit(ControlMessageType::DrSwap).unwrap();
    harness.run_until(|state| state == PolicyState::SourceSendDrSwap(Exchange::AwaitResponse));
    harness
        .driver()
        .inject_control(PowerRole::Sink, ControlMessageType::Accept);
    harness.run_until(|state| state == PolicyState::SourceReady);

    assert_eq!(harness.port.data_role(), DataRole::Ufp);
    assert_eq!(harness.port.driver().roles, (true, false));
    assert!(harness.port.has_contract());
}

#[test]
fn power_role_swap_rejected_by_source_only_port() {
    let mut harness = Harness::new(PortConfig {
        port_type: PortType::Source,
        ..Default::default()
    });
    harness.port.enable(PowerRole::Source).unwrap();
    harness.source_contract(fixed_request(1, 200));

    harness
        .driver()
        .inject_control(PowerRole::Sink, ControlMessageType::PrSwap);
    harness.run_until(|state| matches!(state, PolicyState::SourceEvaluatePrSwap(_)));
    harness.run_until(|state| state == PolicyState::SourceReady);

    assert!(is_control(&harness.last_sent(), ControlMessageType::Reject));
    assert_eq!(harness.port.power_role(), PowerRole::Source);
}

#[test]
fn busy_transmit_slot() {
    let mut harness = Harness::source(PortConfig::default());
    harness.source_contract(fixed_request(1, 200));

    harness.port.request_transmit(ControlMessageType::Ping).unwrap();
    assert_eq!(
        harness.port.request_transmit(ControlMessageType::GetSinkCap),
        Err(Error::TransmitSlotBusy)
    );

    harness.run_until(|state| state == PolicyState::SourceSendPing);
    harness.run_until(|state| state == PolicyState::SourceReady);
    assert!(is_control(&harness.last_sent(), ControlMessageType::Ping));
    assert!(harness.port.pending_request().is_none());
}

#[test]
fn disable_notifies_contract_loss() {
    let mut harness = Harness::source(PortConfig::default());
    harness.source_contract(fixed_request(1, 200));

    harness.port.disable().unwrap();

    assert_eq!(harness.port.state(), PolicyState::Disabled);
    assert!(!harness.port.has_contract());
    let events = harness.events.events();
    assert_eq!(&events[events.len() - 2..], &[Event::BistDisabled, Event::NoContract]);
    assert_eq!(
        harness.port.request_transmit(ControlMessageType::Ping),
        Err(Error::PortDisabled)
    );
}

#[test]
fn state_ids_are_unique() {
    let states = [
        PolicyState::Disabled,
        PolicyState::ErrorRecovery,
        PolicyState::SourceReady,
        PolicyState::SinkReady,
        PolicyState::SourceStartup(StartupStep::Init),
        PolicyState::SinkStartup,
    ];
    for (i, a) in states.iter().enumerate() {
        for b in &states[i + 1..] {
            assert_ne!(a.id(), b.id());
        }
    }
}

fn bist(mode: BistMode) -> Data {
    Data::Bist(BistDataObject::default().with_mode(mode))
}

#[test]
fn source_rejects_request_under_valid_contract() {
    let mut harness = Harness::source(PortConfig::default());
    harness.source_contract(fixed_request(1, 200));

    // 4 A from a 3 A supply
    harness.inject_data(PowerRole::Sink, Data::Request(fixed_request(1, 400)));
    harness.run_until(|state| state == PolicyState::SourceCapabilityResponse);
    harness.run_until(|state| state == PolicyState::SourceReady);

    assert!(is_control(&harness.last_sent(), ControlMessageType::Reject));
    assert_eq!(harness.port.contract(), Some(fixed_request(1, 200)));
    assert_eq!(harness.port.driver().hard_resets, 0);
}

#[test]
fn source_rejects_then_hard_resets_when_contract_is_lost() {
    let mut harness = Harness::source(PortConfig::default());
    harness.source_contract(fixed_request(2, 300));

    // The present contract exceeds the advertised 3 A.
    harness.port.contract = fixed_request(2, 400);
    harness.inject_data(PowerRole::Sink, Data::Request(fixed_request(1, 400)));
    harness.run_until(|state| state == PolicyState::SourceCapabilityResponse);
    harness.run_until(|state| matches!(state, PolicyState::SourceTransitionDefault(_)));

    assert!(is_control(&harness.last_sent(), ControlMessageType::Reject));
    assert_eq!(harness.port.driver().hard_resets, 1);
    assert!(!harness.port.has_contract());
}

#[test]
fn pr_swap_accepted_as_source_ends_as_sink() {
    let mut harness = Harness::source(PortConfig::default());
    harness.source_contract(fixed_request(1, 200));

    harness.port.request_transmit(ControlMessageType::PrSwap).unwrap();
    harness.run_until(|state| state == PolicyState::SourceSendPrSwap(SourcePrSwapStep::AwaitAccept));
    assert!(is_control(&harness.last_sent(), ControlMessageType::PrSwap));

    harness
        .driver()
        .inject_control(PowerRole::Sink, ControlMessageType::Accept);
    harness.run_until(|state| state == PolicyState::SourceSendPrSwap(SourcePrSwapStep::WaitTransition));
    harness.clock.advance(TimerType::SrcTransition.duration_ms());
    harness.run_until(|state| state == PolicyState::SourceSendPrSwap(SourcePrSwapStep::WaitVsafe0v));
    assert!(harness.port.dpm().discharge);

    harness.driver().vbus_vsafe5v = false;
    harness.driver().vbus_vsafe0v = true;
    harness.run_until(|state| state == PolicyState::SourceSendPrSwap(SourcePrSwapStep::AwaitPsRdy));

    let ps_rdy = harness.last_sent();
    assert!(is_control(&ps_rdy, ControlMessageType::PsRdy));
    assert_eq!(ps_rdy.header.port_power_role(), PowerRole::Sink);
    assert_eq!(harness.port.dpm().swapped_to, Some(PowerRole::Sink));
    assert!(!harness.port.dpm().discharge);

    harness
        .driver()
        .inject_control(PowerRole::Source, ControlMessageType::PsRdy);
    harness.run_until(|state| state == PolicyState::SinkWaitCaps);

    assert_eq!(harness.port.power_role(), PowerRole::Sink);
    assert_eq!(harness.port.data_role(), DataRole::Dfp);
    assert_eq!(harness.port.driver().roles, (false, true));
    assert!(!harness.port.has_contract());
    assert_eq!(harness.port.driver().hard_resets, 0);
}

#[test]
fn vconn_swap_accept() {
    let mut harness = Harness::sink(PortConfig::default());
    harness.sink_contract();
    assert!(!harness.port.is_vconn_source());

    harness
        .driver()
        .inject_control(PowerRole::Source, ControlMessageType::VconnSwap);
    harness.run_until(|state| state == PolicyState::SinkEvaluateVconnSwap(VconnSwapStep::Settle));
    assert!(is_control(&harness.last_sent(), ControlMessageType::Accept));
    assert!(harness.port.driver().vconn);
    assert!(!harness.port.is_vconn_source());

    harness.clock.advance(TimerType::VCONNSourceOn.duration_ms());
    harness.run_until(|state| state == PolicyState::SinkReady);

    assert!(is_control(&harness.last_sent(), ControlMessageType::PsRdy));
    assert!(harness.port.is_vconn_source());
    assert!(harness.port.has_contract());
}

#[test]
fn vconn_swap_timeout_returns_to_ready() {
    let mut harness = Harness::source(PortConfig::default());
    harness.source_contract(fixed_request(1, 200));
    assert!(harness.port.is_vconn_source());

    harness.port.request_transmit(ControlMessageType::VconnSwap).unwrap();
    harness.run_until(|state| state == PolicyState::SourceSendVconnSwap(VconnSwapStep::AwaitResponse));
    harness
        .driver()
        .inject_control(PowerRole::Sink, ControlMessageType::Accept);
    harness.run_until(|state| state == PolicyState::SourceSendVconnSwap(VconnSwapStep::AwaitPsRdy));

    // The partner never reports VCONN on.
    harness.clock.advance(TimerType::VCONNSourceOn.duration_ms());
    harness.run_until(|state| state == PolicyState::SourceReady);

    assert!(harness.port.is_vconn_source());
    assert!(harness.port.has_contract());
    assert_eq!(harness.port.driver().hard_resets, 0);
}

#[test]
fn bist_carrier_mode_ends_in_hard_reset() {
    let mut harness = Harness::source(PortConfig::default());
    harness.source_contract(fixed_request(1, 200));

    harness.inject_data(PowerRole::Sink, bist(BistMode::CarrierMode2));
    harness.run_until(|state| state == PolicyState::BistCarrierMode2(BistStep::Transmit));
    assert!(harness.port.driver().bist_carrier);
    assert!(harness.events.events().contains(&Event::BistEnabled));

    harness.clock.advance(TimerType::BISTContMode.duration_ms());
    harness.run_until(|state| state == PolicyState::BistCarrierMode2(BistStep::Settle));
    assert!(!harness.port.driver().bist_carrier);
    assert!(harness.events.events().contains(&Event::BistDisabled));

    harness.clock.advance(TimerType::GoodCRCDelay.duration_ms());
    harness.run_until(|state| matches!(state, PolicyState::SourceTransitionDefault(_)));
    assert_eq!(harness.port.driver().hard_resets, 1);
}

#[test]
fn bist_test_data_until_hard_reset() {
    let mut harness = Harness::source(PortConfig::default());
    harness.source_contract(fixed_request(1, 200));

    harness.inject_data(PowerRole::Sink, bist(BistMode::TestData));
    harness.run_until(|state| state == PolicyState::BistTestData);
    assert!(harness.port.driver().rx_auto_flush);
    assert_eq!(harness.port.protocol_state(), ProtocolState::Disabled);
    assert!(harness.events.events().contains(&Event::BistEnabled));

    harness.driver().inject_hard_reset();
    harness.run();
    assert_eq!(
        harness.port.state(),
        PolicyState::SourceTransitionDefault(SourceDefaultStep::WaitHardReset)
    );
    assert_eq!(harness.port.protocol_state(), ProtocolState::Idle);

    harness.clock.advance(TimerType::PSHardReset.duration_ms());
    harness.run();
    assert_eq!(
        harness.port.state(),
        PolicyState::SourceTransitionDefault(SourceDefaultStep::PowerOff)
    );
    let events = harness.events.events();
    assert_eq!(&events[events.len() - 2..], &[Event::BistDisabled, Event::NoContract]);
}

#[test]
fn bist_requires_vsafe5v_contract() {
    let mut harness = Harness::source(PortConfig::default());
    harness.source_contract(fixed_request(2, 200));
    let sent_before = harness.port.driver().transmitted.len();

    harness.inject_data(PowerRole::Sink, bist(BistMode::CarrierMode2));
    for _ in 0..3 {
        harness.run();
    }

    assert_eq!(harness.port.state(), PolicyState::SourceReady);
    assert!(!harness.port.driver().bist_carrier);
    assert!(!harness.events.events().contains(&Event::BistEnabled));
    assert_eq!(harness.port.driver().transmitted.len(), sent_before);
}

#[test]
fn source_goto_min() {
    let mut harness = Harness::source(PortConfig::default());
    harness.source_contract(fixed_request(1, 200));

    harness.port.request_transmit(ControlMessageType::GotoMin).unwrap();
    harness.run_until(|state| state == PolicyState::SourceGotoMin(GotoMinStep::WaitTransition));
    assert!(is_control(&harness.last_sent(), ControlMessageType::GotoMin));

    harness.clock.advance(TimerType::SrcTransition.duration_ms());
    harness.run_until(|state| state == PolicyState::SourceReady);

    assert!(is_control(&harness.last_sent(), ControlMessageType::PsRdy));
    assert!(harness.port.has_contract());
}

#[test]
fn sink_goto_min() {
    let mut harness = Harness::sink(PortConfig::default());
    harness.sink_contract();

    harness
        .driver()
        .inject_control(PowerRole::Source, ControlMessageType::GotoMin);
    harness.run_until(|state| state == PolicyState::SinkTransitionSink);
    harness
        .driver()
        .inject_control(PowerRole::Source, ControlMessageType::PsRdy);
    harness.run_until(|state| state == PolicyState::SinkReady);

    assert!(harness.port.has_contract());
    let contracts = harness
        .events
        .events()
        .into_iter()
        .filter(|&event| event == Event::NewContract)
        .count();
    assert_eq!(contracts, 2);
}

#[test]
fn sink_rejected_without_contract_waits_for_caps() {
    let mut harness = Harness::sink(PortConfig::default());
    harness.run_until(|state| state == PolicyState::SinkWaitCaps);
    harness.inject_data(PowerRole::Source, Data::SourceCapabilities(partner_caps()));
    harness.run_until(|state| state == PolicyState::SinkSelectCapability(Exchange::AwaitResponse));

    harness
        .driver()
        .inject_control(PowerRole::Source, ControlMessageType::Reject);
    harness.run_until(|state| state == PolicyState::SinkWaitCaps);
    assert!(!harness.port.has_contract());
    assert!(harness.port.hard_reset_counter.exceeded());

    // Once given up, the wait for capabilities ends without a hard reset.
    harness.clock.advance(TimerType::TypeCSinkWaitCap.duration_ms());
    for _ in 0..4 {
        harness.run();
    }
    assert_eq!(harness.port.state(), PolicyState::SinkWaitCaps);
    assert_eq!(harness.port.driver().hard_resets, 0);
}

#[test]
fn sink_wait_keeps_contract() {
    let mut harness = Harness::sink(PortConfig::default());
    harness.sink_contract();
    let contract = harness.port.contract();

    harness.inject_data(PowerRole::Source, Data::SourceCapabilities(partner_caps()));
    harness.run_until(|state| state == PolicyState::SinkSelectCapability(Exchange::AwaitResponse));
    harness
        .driver()
        .inject_control(PowerRole::Source, ControlMessageType::Wait);
    harness.run_until(|state| state == PolicyState::SinkReady);

    assert_eq!(harness.port.contract(), contract);
    assert!(!harness.port.hard_reset_counter.exceeded());
    assert_eq!(harness.port.driver().hard_resets, 0);
}
