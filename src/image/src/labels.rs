//! Well-known labels and annotations.
//!
//! Garbage-collection labels follow the containerd conventions so that a
//! store populated by this crate stays readable by containerd tooling.

/// Prefix of content GC reference labels (`<prefix>.<kind>[.<i>]`).
pub const GC_REF_CONTENT: &str = "containerd.io/gc.ref.content";

/// Prefix of snapshot GC reference labels (`<prefix>.<snapshotter>`).
pub const GC_REF_SNAPSHOT: &str = "containerd.io/gc.ref.snapshot";

/// Marks a snapshot or blob as a GC root.
pub const GC_ROOT: &str = "containerd.io/gc.root";

/// Diff ID of a compressed layer blob.
pub const UNCOMPRESSED: &str = "containerd.io/uncompressed";

/// Distribution source recorded on fetched blobs (`<prefix>.<domain>`).
pub const DISTRIBUTION_SOURCE: &str = "containerd.io/distribution.source";

/// Image name annotation written into archive indexes.
pub const ANNOTATION_IMAGE_NAME: &str = "io.containerd.image.name";

/// OCI reference name annotation.
pub const ANNOTATION_REF_NAME: &str = "org.opencontainers.image.ref.name";

/// Image record label set by the CRI plugin on images it manages.
pub const CRI_MANAGED: &str = "io.cri-containerd.image";

/// eStargz TOC digest annotation on converted layers.
pub const ESTARGZ_TOC_DIGEST: &str = "containerd.io/snapshot/stargz/toc.digest";

/// eStargz uncompressed size annotation.
pub const ESTARGZ_UNCOMPRESSED_SIZE: &str = "io.containers.estargz.uncompressed-size";

/// Layer digest a separately stored eStargz TOC belongs to.
pub const ESTARGZ_LAYER_DIGEST: &str = "containerd.io/snapshot/stargz/layer.digest";

/// zstd:chunked manifest checksum annotation.
pub const ZSTD_CHUNKED_MANIFEST_CHECKSUM: &str =
    "io.github.containers.zstd-chunked.manifest-checksum";

/// zstd:chunked manifest position annotation (`offset:length:uncompressed:type`).
pub const ZSTD_CHUNKED_MANIFEST_POSITION: &str =
    "io.github.containers.zstd-chunked.manifest-position";

/// Wrapped layer keys of a symmetrically encrypted layer.
pub const ENC_KEYS_SYM: &str = "org.opencontainers.image.enc.keys.sym";

/// Prefix of the per-protocol wrapped-key annotations (`jwe`, `pgp`, `pkcs7`, ...).
pub const ENC_KEYS_PREFIX: &str = "org.opencontainers.image.enc.keys.";

/// Public encryption parameters of an encrypted layer.
pub const ENC_PUBOPTS: &str = "org.opencontainers.image.enc.pubopts";

/// Lease label recording the operation that took the lease.
pub const LEASE_OWNER: &str = "cask.io/lease.owner";

/// Content label for the config's snapshot reference under `snapshotter`.
pub fn gc_snapshot_label(snapshotter: &str) -> String {
    format!("{GC_REF_SNAPSHOT}.{snapshotter}")
}

/// Content label recording the registry a blob was fetched from.
pub fn distribution_source_label(domain: &str) -> String {
    format!("{DISTRIBUTION_SOURCE}.{domain}")
}
