//! Media types for Docker schema 2 and OCI content.

pub const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const DOCKER_MANIFEST_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
pub const DOCKER_CONFIG: &str = "application/vnd.docker.container.image.v1+json";
pub const DOCKER_LAYER: &str = "application/vnd.docker.image.rootfs.diff.tar";
pub const DOCKER_LAYER_GZIP: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";
pub const DOCKER_LAYER_ZSTD: &str = "application/vnd.docker.image.rootfs.diff.tar.zstd";
pub const DOCKER_LAYER_FOREIGN: &str =
    "application/vnd.docker.image.rootfs.foreign.diff.tar.gzip";

pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const OCI_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
pub const OCI_LAYER: &str = "application/vnd.oci.image.layer.v1.tar";
pub const OCI_LAYER_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
pub const OCI_LAYER_ZSTD: &str = "application/vnd.oci.image.layer.v1.tar+zstd";
pub const OCI_LAYER_NONDIST: &str = "application/vnd.oci.image.layer.nondistributable.v1.tar";
pub const OCI_LAYER_NONDIST_GZIP: &str =
    "application/vnd.oci.image.layer.nondistributable.v1.tar+gzip";
pub const OCI_LAYER_NONDIST_ZSTD: &str =
    "application/vnd.oci.image.layer.nondistributable.v1.tar+zstd";

/// Suffix appended to the media type of an encrypted layer.
pub const ENCRYPTED_SUFFIX: &str = "+encrypted";

/// Layer compression as declared by the media type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Uncompressed,
    Gzip,
    Zstd,
}

pub fn is_manifest(media_type: &str) -> bool {
    media_type == DOCKER_MANIFEST || media_type == OCI_MANIFEST
}

pub fn is_index(media_type: &str) -> bool {
    media_type == DOCKER_MANIFEST_LIST || media_type == OCI_INDEX
}

pub fn is_config(media_type: &str) -> bool {
    media_type == DOCKER_CONFIG || media_type == OCI_CONFIG
}

pub fn is_docker(media_type: &str) -> bool {
    media_type.starts_with("application/vnd.docker.")
}

pub fn is_encrypted(media_type: &str) -> bool {
    media_type.ends_with(ENCRYPTED_SUFFIX)
}

/// True for any layer media type, encrypted or not.
pub fn is_layer(media_type: &str) -> bool {
    let base = media_type.trim_end_matches(ENCRYPTED_SUFFIX);
    base.starts_with("application/vnd.oci.image.layer.")
        || base.starts_with("application/vnd.docker.image.rootfs.")
}

pub fn is_nondistributable(media_type: &str) -> bool {
    media_type.contains(".nondistributable.") || media_type.contains(".foreign.")
}

/// Compression implied by a layer media type.
pub fn compression(media_type: &str) -> Compression {
    let base = media_type.trim_end_matches(ENCRYPTED_SUFFIX);
    if base.ends_with("+gzip") || base.ends_with(".tar.gzip") {
        Compression::Gzip
    } else if base.ends_with("+zstd") || base.ends_with(".tar.zstd") {
        Compression::Zstd
    } else {
        Compression::Uncompressed
    }
}

/// Layer media type with the same family and distributability but a
/// different compression.
pub fn with_compression(media_type: &str, compression: Compression) -> String {
    let docker = is_docker(media_type);
    let nondist = is_nondistributable(media_type);
    let base = match (docker, nondist) {
        (true, true) => return DOCKER_LAYER_FOREIGN.to_string(),
        (true, false) => DOCKER_LAYER,
        (false, true) => OCI_LAYER_NONDIST,
        (false, false) => OCI_LAYER,
    };
    match (compression, docker) {
        (Compression::Uncompressed, _) => base.to_string(),
        (Compression::Gzip, true) => format!("{base}.gzip"),
        (Compression::Zstd, true) => format!("{base}.zstd"),
        (Compression::Gzip, false) => format!("{base}+gzip"),
        (Compression::Zstd, false) => format!("{base}+zstd"),
    }
}

/// OCI equivalent of a Docker schema 2 media type. OCI and unknown media
/// types are returned unchanged.
pub fn docker_to_oci(media_type: &str) -> String {
    let (base, encrypted) = match media_type.strip_suffix(ENCRYPTED_SUFFIX) {
        Some(base) => (base, ENCRYPTED_SUFFIX),
        None => (media_type, ""),
    };
    let converted = match base {
        DOCKER_MANIFEST => OCI_MANIFEST,
        DOCKER_MANIFEST_LIST => OCI_INDEX,
        DOCKER_CONFIG => OCI_CONFIG,
        DOCKER_LAYER => OCI_LAYER,
        DOCKER_LAYER_GZIP => OCI_LAYER_GZIP,
        DOCKER_LAYER_ZSTD => OCI_LAYER_ZSTD,
        DOCKER_LAYER_FOREIGN => OCI_LAYER_NONDIST_GZIP,
        other => other,
    };
    format!("{converted}{encrypted}")
}
