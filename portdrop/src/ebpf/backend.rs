use portdrop_common::PortValue;

use crate::{
    ebpf::{
        artifact::{ArtifactSource, ProgramSpec},
        attach::{self, AttachRequest, XdpAttachment},
        collection::{CollectionNames, FilterCollection},
        memlock, publish,
    },
    error::Result,
};

/// Kernel-facing operations the lifecycle drives, in startup order.
///
/// [`AyaBackend`] talks to the kernel; tests substitute a recording fake so
/// ordering and cleanup can be checked without privileges.
pub trait Backend {
    /// Live program and table handles.
    type Collection;
    /// Revocation handle for one attachment.
    type Attachment;

    fn load_artifact(&mut self, source: &ArtifactSource) -> Result<ProgramSpec> {
        ProgramSpec::load(source)
    }

    fn relax_memlock(&mut self) -> Result<()>;

    fn materialize(
        &mut self,
        spec: &ProgramSpec,
        names: &CollectionNames,
    ) -> Result<Self::Collection>;

    /// Detaches whatever a previous run left behind. Returns whether anything was found.
    fn clear_stale(&mut self, request: &AttachRequest) -> Result<bool>;

    fn attach(
        &mut self,
        collection: &mut Self::Collection,
        request: &AttachRequest,
    ) -> Result<Self::Attachment>;

    fn write_port(&mut self, collection: &mut Self::Collection, port: PortValue) -> Result<()>;

    fn read_port(&mut self, collection: &mut Self::Collection) -> Result<PortValue>;

    fn detach(
        &mut self,
        collection: &mut Self::Collection,
        attachment: Self::Attachment,
    ) -> Result<()>;

    fn release(&mut self, collection: Self::Collection);
}

/// Backend driving the real kernel through aya.
#[derive(Debug, Default)]
pub struct AyaBackend;

impl Backend for AyaBackend {
    type Collection = FilterCollection;
    type Attachment = XdpAttachment;

    fn relax_memlock(&mut self) -> Result<()> {
        memlock::remove_memlock_limit()
    }

    fn materialize(&mut self, spec: &ProgramSpec, names: &CollectionNames) -> Result<FilterCollection> {
        FilterCollection::materialize(spec, names)
    }

    fn clear_stale(&mut self, request: &AttachRequest) -> Result<bool> {
        attach::clear_stale(request)
    }

    fn attach(
        &mut self,
        collection: &mut FilterCollection,
        request: &AttachRequest,
    ) -> Result<XdpAttachment> {
        attach::attach(collection, request)
    }

    fn write_port(&mut self, collection: &mut FilterCollection, port: PortValue) -> Result<()> {
        publish::write_port(collection, port)
    }

    fn read_port(&mut self, collection: &mut FilterCollection) -> Result<PortValue> {
        publish::read_port(collection)
    }

    fn detach(&mut self, collection: &mut FilterCollection, attachment: XdpAttachment) -> Result<()> {
        attach::detach(collection, attachment)
    }

    fn release(&mut self, collection: FilterCollection) {
        collection.release();
    }
}
