use std::io::Read;

use crate::error::{Error, Result};

use super::{Blob, BlobBlock, Decoder, Metadata, Object, SequencePointBlock, StackBlock, Trace};

/// Outcome of draining one object from the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    EndOfStream,
}

/// Receiver for decoded stream content. Every method defaults to a no-op, so
/// implementors only override what they consume. Borrowed arguments are
/// valid for the duration of the call only; an error return aborts the
/// stream.
pub trait EventSink {
    fn event(&mut self, _blob: &Blob<'_>) -> Result<()> {
        Ok(())
    }

    fn metadata(&mut self, _metadata: &Metadata) -> Result<()> {
        Ok(())
    }

    fn stack_block(&mut self, _block: &StackBlock) -> Result<()> {
        Ok(())
    }

    fn sequence_point_block(&mut self, _block: &SequencePointBlock) -> Result<()> {
        Ok(())
    }
}

/// Drives a [`Decoder`] and dispatches each decoded object to an
/// [`EventSink`]. Event and metadata blocks share the blob reader; event
/// blobs are delivered raw while metadata blobs are decoded into
/// [`Metadata`] records first.
pub struct Stream<R> {
    decoder: Decoder<R>,
    trace: Option<Trace>,
}

impl<R: Read> Stream<R> {
    pub fn new(source: R) -> Self {
        Stream {
            decoder: Decoder::new(source),
            trace: None,
        }
    }

    /// Runs the stream preamble and returns the trace header.
    pub fn open(&mut self) -> Result<Trace> {
        let trace = self.decoder.open_trace()?;
        self.trace = Some(trace);
        Ok(trace)
    }

    pub fn trace(&self) -> Option<&Trace> {
        self.trace.as_ref()
    }

    /// Decodes one object and routes it to the sink. Objects within a block
    /// are delivered in file order. Opens the stream first if [`open`] has
    /// not been called.
    ///
    /// [`open`]: Stream::open
    pub fn next(&mut self, sink: &mut dyn EventSink) -> Result<Status> {
        if self.trace.is_none() {
            self.open()?;
        }
        let Some(object) = self.decoder.next_object()? else {
            return Ok(Status::EndOfStream);
        };
        match object.type_name.as_str() {
            "EventBlock" => deliver_events(object, sink)?,
            "MetadataBlock" => deliver_metadata(object, sink)?,
            "StackBlock" => sink.stack_block(&StackBlock::from_object(object)?)?,
            "SPBlock" => sink.sequence_point_block(&SequencePointBlock::from_object(object)?)?,
            _ => return Err(Error::UnknownObjectType(object.type_name)),
        }
        Ok(Status::Ok)
    }

}

fn deliver_events(object: Object, sink: &mut dyn EventSink) -> Result<()> {
    let mut block = BlobBlock::from_object(object)?;
    while let Some(blob) = block.next_blob()? {
        sink.event(&blob)?;
    }
    Ok(())
}

fn deliver_metadata(object: Object, sink: &mut dyn EventSink) -> Result<()> {
    let mut block = BlobBlock::from_object(object)?;
    while let Some(blob) = block.next_blob()? {
        let metadata = Metadata::from_blob(&blob)?;
        log::trace!(
            "metadata {}: {} event {}",
            metadata.header.metadata_id,
            metadata.header.provider_name,
            metadata.header.event_id
        );
        sink.metadata(&metadata)?;
    }
    Ok(())
}
