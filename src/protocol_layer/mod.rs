//! The protocol layer is controlled by the policy engine, and commands the PHY layer.
//!
//! Handles
//! - construction of messages,
//! - message timers and timeouts,
//! - message retry counters,
//! - duplicate detection,
//! - chunked extended messages,
//! - reset operation.
pub mod message;

use core::marker::PhantomData;

use embassy_futures::select::{Either, select};
use heapless::Vec;
use message::data::Data;
use message::data::vdm::Vdm;
use message::extended::chunked::{
    ChunkResult, ChunkedMessageAssembler, ChunkedMessageSender, MAX_EXTENDED_MSG_LEN,
};
use message::extended::{Extended, ExtendedHeader};
use message::header::{ControlMessageType, DataMessageType, ExtendedMessageType, Header, MessageType};
use message::{Message, ParseError, Payload};
use typec_pd_traits::{Driver, DriverRxError, DriverTxError};

use crate::counters::{Counter, CounterType};
use crate::timers::{Timer, TimerType};
use crate::{DataRole, PowerRole};

/// The largest packet, either seven data objects or one extended message chunk.
pub const MAX_MESSAGE_SIZE: usize = 30;

/// Errors that can occur during reception.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RxError {
    /// Port partner requested soft reset.
    #[error("soft reset requested by port partner")]
    SoftReset,
    /// Driver reported a hard reset.
    #[error("hard reset")]
    HardReset,
    /// A timeout during message reception.
    #[error("receive timeout")]
    ReceiveTimeout,
    /// A message of a reserved type was received.
    #[error("unsupported message")]
    UnsupportedMessage,
}

/// Errors that can occur during transmission.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TxError {
    /// Driver reported a hard reset.
    #[error("hard reset")]
    HardReset,
}

/// Errors that the protocol layer reports to the policy engine.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ProtocolError {
    /// Reception failed.
    #[error("receive error: {0}")]
    RxError(#[from] RxError),
    /// Transmission failed.
    #[error("transmit error: {0}")]
    TxError(#[from] TxError),
    /// No GoodCRC was received, even after all retries.
    #[error("transmit retries exceeded")]
    TransmitRetriesExceeded,
    /// A message was received that is not expected in the present state.
    #[error("unexpected message")]
    UnexpectedMessage,
}

#[derive(Debug)]
struct Counters {
    rx_message: Option<Counter>,
    tx_message: Counter,
    retry: Counter,
}

impl Default for Counters {
    fn default() -> Self {
        Counters {
            rx_message: None,
            tx_message: Counter::new(CounterType::MessageId),
            retry: Counter::new(CounterType::Retry),
        }
    }
}

/// The USB PD protocol layer.
pub struct ProtocolLayer<DRIVER: Driver, TIMER: Timer> {
    driver: DRIVER,
    counters: Counters,
    default_header: Header,
    assembler: ChunkedMessageAssembler,
    _timer: PhantomData<TIMER>,
}

impl<DRIVER: Driver, TIMER: Timer> ProtocolLayer<DRIVER, TIMER> {
    /// Create a new protocol layer from a driver and default header.
    pub fn new(driver: DRIVER, default_header: Header) -> Self {
        Self {
            driver,
            counters: Default::default(),
            default_header,
            assembler: ChunkedMessageAssembler::new(),
            _timer: PhantomData,
        }
    }

    /// Reset message counters and drop partially received messages.
    ///
    /// The electrical contract is not affected.
    pub fn reset(&mut self) {
        self.counters = Default::default();
        self.assembler.reset();
    }

    /// Access the driver.
    pub fn driver(&mut self) -> &mut DRIVER {
        &mut self.driver
    }

    /// The header template that outgoing messages are built from.
    pub fn header(&self) -> &Header {
        &self.default_header
    }

    /// Change the power role that outgoing messages carry.
    pub fn set_power_role(&mut self, power_role: PowerRole) {
        self.default_header = self.default_header.with_port_power_role(power_role);
    }

    /// Change the data role that outgoing messages carry.
    pub fn set_data_role(&mut self, data_role: DataRole) {
        self.default_header = self.default_header.with_port_data_role(data_role);
    }

    /// Wait for VBUS to be available.
    pub async fn wait_for_vbus(&self) {
        self.driver.wait_for_vbus().await
    }

    async fn transmit_inner(&mut self, buffer: &[u8]) -> Result<(), TxError> {
        loop {
            match self.driver.transmit(buffer).await {
                Ok(_) => return Ok(()),
                Err(DriverTxError::HardReset) => return Err(TxError::HardReset),
                Err(DriverTxError::Discarded) => {
                    // Retry transmission.
                }
            }
        }
    }

    /// Receive frames until one parses.
    async fn receive_frame(&mut self) -> Result<Message, RxError> {
        loop {
            let mut buffer = [0u8; MAX_MESSAGE_SIZE];

            let length = match self.driver.receive(&mut buffer).await {
                Ok(length) => length,
                Err(DriverRxError::Discarded) => continue,
                Err(DriverRxError::HardReset) => return Err(RxError::HardReset),
            };

            match Message::from_bytes(&buffer[..length]) {
                Ok(message) => return Ok(message),
                Err(error) => warn!("Discarding malformed message: {:?}", error),
            }
        }
    }

    /// Wait until a GoodCRC for the last transmitted message is received, or a timeout occurs.
    async fn wait_for_good_crc(&mut self) -> Result<(), ProtocolError> {
        let expected_id = self.counters.tx_message.value();

        let receive_fut = async {
            loop {
                let message = self.receive_frame().await?;

                if !matches!(
                    message.header.message_type(),
                    MessageType::Control(ControlMessageType::GoodCRC)
                ) {
                    return Err(ProtocolError::UnexpectedMessage);
                }

                if message.header.message_id() == expected_id {
                    return Ok(());
                }

                trace!(
                    "GoodCRC for ID {}, expected {}",
                    message.header.message_id(),
                    expected_id
                );
            }
        };

        match select(receive_fut, TimerType::get_timer::<TIMER>(TimerType::CRCReceive)).await {
            Either::First(result) => result,
            Either::Second(_) => Err(RxError::ReceiveTimeout.into()),
        }
    }

    /// Transmit a message, retrying until it is acknowledged.
    ///
    /// GoodCRC messages are never sent through here.
    pub async fn transmit(&mut self, message: Message) -> Result<(), ProtocolError> {
        trace!("Transmit message {:?}", message);

        let mut buffer = [0u8; MAX_MESSAGE_SIZE];
        let size = message.to_bytes(&mut buffer);
        self.counters.retry.reset();

        loop {
            self.transmit_inner(&buffer[..size]).await?;

            if DRIVER::HAS_AUTO_GOOD_CRC {
                _ = self.counters.tx_message.increment();
                return Ok(());
            }

            match self.wait_for_good_crc().await {
                Ok(()) => {
                    // See [6.7.1.1]
                    _ = self.counters.tx_message.increment();
                    return Ok(());
                }
                Err(ProtocolError::RxError(RxError::ReceiveTimeout)) => {
                    if self.counters.retry.increment().is_err() {
                        // The message ID advances, even though the message was never acknowledged.
                        _ = self.counters.tx_message.increment();
                        warn!("No GoodCRC for {:?}", message.header.message_type());
                        return Err(ProtocolError::TransmitRetriesExceeded);
                    }
                    trace!("Retransmit, retry {}", self.counters.retry.value());
                }
                Err(other) => return Err(other),
            }
        }
    }

    async fn transmit_good_crc(&mut self, message_id: u8) -> Result<(), ProtocolError> {
        let mut buffer = [0u8; MAX_MESSAGE_SIZE];

        let size = Message::new(Header::new_control(
            self.default_header,
            Counter::new_from_value(CounterType::MessageId, message_id),
            ControlMessageType::GoodCRC,
        ))
        .to_bytes(&mut buffer);

        Ok(self.transmit_inner(&buffer[..size]).await?)
    }

    /// Updates the received message counter.
    ///
    /// If receiving the first message after protocol layer reset, copy its ID.
    /// Otherwise, compare the received ID with the stored ID. If they are equal, this is a retransmission.
    ///
    /// Returns `true`, if this was a retransmission.
    fn update_rx_message_counter(&mut self, rx_message: &Message) -> bool {
        let message_id = rx_message.header.message_id();

        match self.counters.rx_message.as_mut() {
            None => {
                self.counters.rx_message = Some(Counter::new_from_value(CounterType::MessageId, message_id));
                false
            }
            Some(counter) if counter.value() == message_id => {
                trace!("Received retransmission of message ID {}", message_id);
                true
            }
            Some(counter) => {
                counter.set(message_id);
                false
            }
        }
    }

    /// Use the lower of both revisions from here on.
    fn negotiate_revision(&mut self, header: &Header) {
        if let (Ok(theirs), Ok(ours)) = (header.spec_revision(), self.default_header.spec_revision())
            && theirs < ours
        {
            debug!("Falling back to revision {:?}", theirs);
            self.default_header = self.default_header.with_spec_revision(theirs);
        }
    }

    /// Receive the next message.
    ///
    /// Every message is acknowledged, but retransmissions are only delivered once. Chunked extended
    /// messages are delivered after all chunks were received.
    pub async fn receive_message(&mut self) -> Result<Message, ProtocolError> {
        loop {
            let message = self.receive_frame().await?;
            let message_type = message.header.message_type();

            if matches!(message_type, MessageType::Control(ControlMessageType::GoodCRC)) {
                trace!("Ignoring stray GoodCRC");
                continue;
            }

            // Soft_Reset always carries ID 0, so it bypasses duplicate detection. See [6.8.1]
            if matches!(message_type, MessageType::Control(ControlMessageType::SoftReset))
                && message.header.num_objects() == 0
            {
                if !DRIVER::HAS_AUTO_GOOD_CRC {
                    self.transmit_good_crc(message.header.message_id()).await?;
                }

                self.reset();
                self.counters.rx_message = Some(Counter::new_from_value(
                    CounterType::MessageId,
                    message.header.message_id(),
                ));
                return Err(RxError::SoftReset.into());
            }

            let is_retransmission = self.update_rx_message_counter(&message);

            if !DRIVER::HAS_AUTO_GOOD_CRC {
                self.transmit_good_crc(message.header.message_id()).await?;
            }

            if is_retransmission {
                continue;
            }

            self.negotiate_revision(&message.header);

            match message_type {
                MessageType::Control(ControlMessageType::Reserved)
                | MessageType::Data(DataMessageType::Reserved)
                | MessageType::Extended(ExtendedMessageType::Reserved) => {
                    return Err(RxError::UnsupportedMessage.into());
                }
                MessageType::Extended(_) => {
                    if let Some(message) = self.assemble(message).await? {
                        return Ok(message);
                    }
                }
                _ => return Ok(message),
            }
        }
    }

    /// Feed a chunk to the assembler, requesting the next chunk if needed.
    ///
    /// Returns the complete message, once available.
    async fn assemble(&mut self, message: Message) -> Result<Option<Message>, ProtocolError> {
        let Some(Payload::Extended(extended)) = &message.payload else {
            return Ok(Some(message));
        };

        if !extended.header.chunked() || extended.header.request_chunk() {
            return Ok(Some(message));
        }

        let message_type_raw = message.header.message_type_raw();
        let result = match self
            .assembler
            .process_chunk(message_type_raw, extended.header, &extended.data)
        {
            Err(ParseError::ParserReuse) => {
                debug!("Restarting chunked message");
                self.assembler
                    .process_chunk(message_type_raw, extended.header, &extended.data)
            }
            other => other,
        };

        match result {
            Ok(ChunkResult::Complete(data)) => Ok(Some(Message {
                header: message.header,
                payload: Some(Payload::Extended(Extended {
                    header: ExtendedHeader::new(data.len() as u16),
                    data,
                })),
            })),
            Ok(ChunkResult::NeedMoreChunks(next)) => {
                self.transmit_chunk_request(message_type_raw.into(), next).await?;
                Ok(None)
            }
            Ok(ChunkResult::ChunkRequested(_)) => Ok(None),
            Err(error) => {
                warn!("Dropping chunked message: {:?}", error);
                Ok(None)
            }
        }
    }

    async fn transmit_chunk_request(
        &mut self,
        message_type: ExtendedMessageType,
        chunk_number: u8,
    ) -> Result<(), ProtocolError> {
        let extended = Extended {
            header: ChunkedMessageAssembler::chunk_request_header(chunk_number),
            data: Vec::new(),
        };

        let header = Header::new_extended(
            self.default_header,
            self.counters.tx_message,
            message_type,
            extended.num_objects(),
        );

        self.transmit(Message {
            header,
            payload: Some(Payload::Extended(extended)),
        })
        .await
    }

    /// Wait until a message of one of the chosen types is received, or a timeout occurs.
    pub async fn receive_message_type(
        &mut self,
        message_types: &[MessageType],
        timer_type: TimerType,
    ) -> Result<Message, ProtocolError> {
        let receive_fut = async {
            let message = self.receive_message().await?;

            if message_types.contains(&message.header.message_type()) {
                Ok(message)
            } else {
                debug!("Unexpected message {:?}", message.header.message_type());
                Err(ProtocolError::UnexpectedMessage)
            }
        };

        match select(receive_fut, TimerType::get_timer::<TIMER>(timer_type)).await {
            Either::First(result) => result,
            Either::Second(_) => Err(RxError::ReceiveTimeout.into()),
        }
    }

    /// Perform a hard-reset procedure.
    ///
    // See [6.7.1.1]
    pub async fn hard_reset(&mut self) -> Result<(), ProtocolError> {
        self.reset();

        loop {
            match self.driver.transmit_hard_reset().await {
                Ok(_) | Err(DriverTxError::HardReset) => break,
                Err(DriverTxError::Discarded) => (),
            }
        }

        Ok(())
    }

    /// Transmit a control message of the provided type.
    pub async fn transmit_control_message(&mut self, control_message_type: ControlMessageType) -> Result<(), ProtocolError> {
        let message = Message::new(Header::new_control(
            self.default_header,
            self.counters.tx_message,
            control_message_type,
        ));

        self.transmit(message).await
    }

    /// Transmit a data message.
    pub async fn transmit_data(&mut self, message_type: DataMessageType, data: Data) -> Result<(), ProtocolError> {
        let header = Header::new_data(
            self.default_header,
            self.counters.tx_message,
            message_type,
            data.num_objects(),
        );

        self.transmit(Message::new_with_data(header, data)).await
    }

    /// Transmit a vendor defined message.
    pub async fn transmit_vdm(&mut self, vdm: Vdm) -> Result<(), ProtocolError> {
        self.transmit_data(DataMessageType::VendorDefined, Data::VendorDefined(vdm))
            .await
    }

    /// Transmit an extended message, in chunks if it does not fit a single packet.
    ///
    /// Every chunk after the first is only sent when the port partner requests it.
    pub async fn transmit_extended(&mut self, message_type: ExtendedMessageType, data: &[u8]) -> Result<(), ProtocolError> {
        let data = &data[..data.len().min(MAX_EXTENDED_MSG_LEN)];
        let sender = ChunkedMessageSender::new(data);

        for chunk_number in 0..sender.total_chunks() {
            if chunk_number > 0 {
                let request = self
                    .receive_message_type(&[MessageType::Extended(message_type)], TimerType::ChunkSenderRequest)
                    .await?;

                let requested = match request.payload {
                    Some(Payload::Extended(extended)) if extended.header.request_chunk() => {
                        extended.header.chunk_number()
                    }
                    _ => return Err(ProtocolError::UnexpectedMessage),
                };

                if requested != chunk_number {
                    return Err(ProtocolError::UnexpectedMessage);
                }
            }

            let Some((ext_header, chunk)) = sender.get_chunk(chunk_number) else {
                break;
            };

            let mut extended = Extended {
                header: ext_header,
                data: Vec::new(),
            };
            // A chunk always fits.
            _ = extended.data.extend_from_slice(chunk);

            let header = Header::new_extended(
                self.default_header,
                self.counters.tx_message,
                message_type,
                extended.num_objects(),
            );

            self.transmit(Message {
                header,
                payload: Some(Payload::Extended(extended)),
            })
            .await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dummy::{DummyDriver, DummyTimer, ExpiringTimer};
    use crate::protocol_layer::message::header::SpecificationRevision;

    fn template() -> Header {
        Header::new_template(DataRole::Ufp, PowerRole::Sink, SpecificationRevision::R3_X)
    }

    fn partner_frame(message_type: ControlMessageType, message_id: u8) -> heapless::Vec<u8, MAX_MESSAGE_SIZE> {
        let partner = Header::new_template(DataRole::Dfp, PowerRole::Source, SpecificationRevision::R3_X);
        let mut buffer = [0u8; MAX_MESSAGE_SIZE];
        let size = Message::new(Header::new_control(
            partner,
            Counter::new_from_value(CounterType::MessageId, message_id),
            message_type,
        ))
        .to_bytes(&mut buffer);

        heapless::Vec::from_slice(&buffer[..size]).unwrap()
    }

    fn extended_frame(ext_header: ExtendedHeader, data: &[u8], message_id: u8) -> heapless::Vec<u8, MAX_MESSAGE_SIZE> {
        let partner = Header::new_template(DataRole::Dfp, PowerRole::Source, SpecificationRevision::R3_X);
        let extended = Extended {
            header: ext_header,
            data: heapless::Vec::from_slice(data).unwrap(),
        };
        let header = Header::new_extended(
            partner,
            Counter::new_from_value(CounterType::MessageId, message_id),
            ExtendedMessageType::ManufacturerInfo,
            extended.num_objects(),
        );

        let mut buffer = [0u8; MAX_MESSAGE_SIZE];
        let size = Message {
            header,
            payload: Some(Payload::Extended(extended)),
        }
        .to_bytes(&mut buffer);

        heapless::Vec::from_slice(&buffer[..size]).unwrap()
    }

    #[tokio::test]
    async fn message_ids_wrap_modulo_eight() {
        let mut protocol_layer: ProtocolLayer<DummyDriver, DummyTimer> = ProtocolLayer::new(DummyDriver::new(), template());

        for _ in 0..10 {
            protocol_layer
                .transmit_control_message(ControlMessageType::GetSourceCap)
                .await
                .unwrap();
        }

        let ids: std::vec::Vec<u8> = (0..10)
            .map(|_| {
                let frame = protocol_layer.driver().take_transmitted_data();
                Message::from_bytes(&frame).unwrap().header.message_id()
            })
            .collect();

        assert_eq!(ids, [0, 1, 2, 3, 4, 5, 6, 7, 0, 1]);
    }

    #[tokio::test]
    async fn duplicate_is_acknowledged_but_delivered_once() {
        let mut protocol_layer: ProtocolLayer<DummyDriver<false>, DummyTimer> =
            ProtocolLayer::new(DummyDriver::new(), template());

        protocol_layer
            .driver()
            .inject_received_data(&partner_frame(ControlMessageType::Accept, 3));
        protocol_layer
            .driver()
            .inject_received_data(&partner_frame(ControlMessageType::Accept, 3));
        protocol_layer
            .driver()
            .inject_received_data(&partner_frame(ControlMessageType::PsRdy, 4));

        let first = protocol_layer.receive_message().await.unwrap();
        assert_eq!(
            first.header.message_type(),
            MessageType::Control(ControlMessageType::Accept)
        );

        let second = protocol_layer.receive_message().await.unwrap();
        assert_eq!(second.header.message_type(), MessageType::Control(ControlMessageType::PsRdy));

        // All three frames were acknowledged.
        for expected_id in [3, 3, 4] {
            let good_crc = Message::from_bytes(&protocol_layer.driver().take_transmitted_data()).unwrap();
            assert_eq!(
                good_crc.header.message_type(),
                MessageType::Control(ControlMessageType::GoodCRC)
            );
            assert_eq!(good_crc.header.message_id(), expected_id);
        }
        assert!(!protocol_layer.driver().has_transmitted_data());
    }

    #[tokio::test]
    async fn good_crc_completes_transmission() {
        let mut protocol_layer: ProtocolLayer<DummyDriver<false>, DummyTimer> =
            ProtocolLayer::new(DummyDriver::new(), template());

        protocol_layer
            .driver()
            .inject_received_data(&partner_frame(ControlMessageType::GoodCRC, 0));

        protocol_layer
            .transmit_control_message(ControlMessageType::Accept)
            .await
            .unwrap();

        assert_eq!(protocol_layer.driver().transmitted_count(), 1);
    }

    #[tokio::test]
    async fn retries_are_exhausted_without_good_crc() {
        let mut protocol_layer: ProtocolLayer<DummyDriver<false>, ExpiringTimer> =
            ProtocolLayer::new(DummyDriver::new(), template());

        let result = protocol_layer
            .transmit_control_message(ControlMessageType::Accept)
            .await;
        assert_eq!(result, Err(ProtocolError::TransmitRetriesExceeded));

        // One transmission and two retries.
        assert_eq!(protocol_layer.driver().transmitted_count(), 3);

        // The next message uses the next ID.
        _ = protocol_layer
            .transmit_control_message(ControlMessageType::Accept)
            .await;
        for _ in 0..3 {
            protocol_layer.driver().take_transmitted_data();
        }
        let next = Message::from_bytes(&protocol_layer.driver().take_transmitted_data()).unwrap();
        assert_eq!(next.header.message_id(), 1);
    }

    #[tokio::test]
    async fn soft_reset_is_reported() {
        let mut protocol_layer: ProtocolLayer<DummyDriver, DummyTimer> = ProtocolLayer::new(DummyDriver::new(), template());

        protocol_layer
            .transmit_control_message(ControlMessageType::GetSourceCap)
            .await
            .unwrap();
        protocol_layer
            .driver()
            .inject_received_data(&partner_frame(ControlMessageType::SoftReset, 0));

        assert_eq!(
            protocol_layer.receive_message().await,
            Err(ProtocolError::RxError(RxError::SoftReset))
        );

        // Transmit counter restarts at zero.
        protocol_layer.driver().take_transmitted_data();
        protocol_layer
            .transmit_control_message(ControlMessageType::Accept)
            .await
            .unwrap();
        let accept = Message::from_bytes(&protocol_layer.driver().take_transmitted_data()).unwrap();
        assert_eq!(accept.header.message_id(), 0);
    }

    #[tokio::test]
    async fn soft_reset_with_stored_id_is_not_a_duplicate() {
        let mut protocol_layer: ProtocolLayer<DummyDriver, DummyTimer> = ProtocolLayer::new(DummyDriver::new(), template());

        protocol_layer
            .driver()
            .inject_received_data(&partner_frame(ControlMessageType::Accept, 0));
        protocol_layer
            .driver()
            .inject_received_data(&partner_frame(ControlMessageType::SoftReset, 0));
        protocol_layer
            .driver()
            .inject_received_data(&partner_frame(ControlMessageType::SoftReset, 0));
        protocol_layer
            .driver()
            .inject_received_data(&partner_frame(ControlMessageType::PsRdy, 1));

        let first = protocol_layer.receive_message().await.unwrap();
        assert_eq!(
            first.header.message_type(),
            MessageType::Control(ControlMessageType::Accept)
        );

        // A repeated Soft_Reset restarts the exchange again.
        for _ in 0..2 {
            assert_eq!(
                protocol_layer.receive_message().await,
                Err(ProtocolError::RxError(RxError::SoftReset))
            );
        }

        // The ID of the Soft_Reset is stored, so ID 1 is new.
        let next = protocol_layer.receive_message().await.unwrap();
        assert_eq!(next.header.message_type(), MessageType::Control(ControlMessageType::PsRdy));
    }

    #[tokio::test]
    async fn chunked_message_is_reassembled() {
        let mut protocol_layer: ProtocolLayer<DummyDriver, DummyTimer> = ProtocolLayer::new(DummyDriver::new(), template());
        let full: [u8; 30] = core::array::from_fn(|i| i as u8);

        let sender = ChunkedMessageSender::new(&full);
        let (header_0, chunk_0) = sender.get_chunk(0).unwrap();
        let (header_1, chunk_1) = sender.get_chunk(1).unwrap();
        protocol_layer
            .driver()
            .inject_received_data(&extended_frame(header_0, chunk_0, 0));
        protocol_layer
            .driver()
            .inject_received_data(&extended_frame(header_1, chunk_1, 1));

        let message = protocol_layer.receive_message().await.unwrap();
        let Some(Payload::Extended(extended)) = message.payload else {
            panic!("expected an extended message");
        };
        assert_eq!(&extended.data[..], &full);

        // The second chunk was requested.
        let request = Message::from_bytes(&protocol_layer.driver().take_transmitted_data()).unwrap();
        let Some(Payload::Extended(request)) = request.payload else {
            panic!("expected a chunk request");
        };
        assert!(request.header.request_chunk());
        assert_eq!(request.header.chunk_number(), 1);
    }

    #[tokio::test]
    async fn long_extended_message_is_sent_on_request() {
        let mut protocol_layer: ProtocolLayer<DummyDriver, DummyTimer> = ProtocolLayer::new(DummyDriver::new(), template());
        let full = [0xA5u8; 30];

        protocol_layer.driver().inject_received_data(&extended_frame(
            ChunkedMessageAssembler::chunk_request_header(1),
            &[],
            0,
        ));

        protocol_layer
            .transmit_extended(ExtendedMessageType::ManufacturerInfo, &full)
            .await
            .unwrap();

        assert_eq!(protocol_layer.driver().transmitted_count(), 2);
        let first = Message::from_bytes(&protocol_layer.driver().take_transmitted_data()).unwrap();
        let Some(Payload::Extended(first)) = first.payload else {
            panic!("expected an extended message");
        };
        assert_eq!(first.data.len(), 26);
        assert_eq!(first.header.data_size(), 30);
    }
}
