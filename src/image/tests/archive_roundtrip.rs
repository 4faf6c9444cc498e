mod common;

use cask_core::ErrorKind;
use cask_image::ops::{self, ImportOptions, ImportSource, LoadOptions, PullOptions, SaveOptions};
use cask_image::{digest, IoStreams};
use common::{client, host, layer, MemoryRegistry};
use tempfile::TempDir;

#[tokio::test]
async fn test_save_then_load_into_another_store() {
    let registry = MemoryRegistry::new();
    let tar = layer(&[("srv/index.html", b"<h1>hi</h1>")]);
    let root = registry.publish("r.example.com/web:1", &host(), &[tar.clone()]);

    let src_dir = TempDir::new().unwrap();
    let src = client(&src_dir, &registry);
    let ctx = src.context();
    let (streams, _, _) = IoStreams::buffered(b"");
    ops::pull(&src, &ctx, &streams, "r.example.com/web:1", &PullOptions::default())
        .await
        .unwrap();

    let out_dir = TempDir::new().unwrap();
    let archive = out_dir.path().join("web.tar");
    let save_opts = SaveOptions {
        output: Some(archive.clone()),
        ..Default::default()
    };
    ops::save(&src, &ctx, &streams, &["r.example.com/web:1".to_string()], &save_opts)
        .await
        .unwrap();
    assert!(std::fs::metadata(&archive).unwrap().len() > 0);

    let dst_dir = TempDir::new().unwrap();
    let dst = client(&dst_dir, &MemoryRegistry::new());
    let dctx = dst.context();
    let (streams, out, _) = IoStreams::buffered(b"");
    let load_opts = LoadOptions {
        input: Some(archive),
        ..Default::default()
    };
    let loaded = ops::load(&dst, &dctx, &streams, &load_opts).await.unwrap();
    assert_eq!(loaded.len(), 1);
    assert_eq!(loaded[0].name, "r.example.com/web:1");
    assert_eq!(loaded[0].target.digest, root.digest);
    assert_eq!(out.text(), "Loaded image: r.example.com/web:1\n");

    let chain = digest::chain_id(&[digest::sha256_of(&tar)]).unwrap();
    let rootfs = dst.snapshotter().mounts(&dctx, &chain).await.unwrap();
    assert_eq!(std::fs::read(rootfs.join("srv/index.html")).unwrap(), b"<h1>hi</h1>");
    assert!(dst.leases().list(&dctx).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_quiet_load_prints_digests() {
    let registry = MemoryRegistry::new();
    let root = registry.publish("r.example.com/web:1", &host(), &[layer(&[("a", b"a")])]);
    let src_dir = TempDir::new().unwrap();
    let src = client(&src_dir, &registry);
    let ctx = src.context();
    let (streams, _, _) = IoStreams::buffered(b"");
    ops::pull(&src, &ctx, &streams, "r.example.com/web:1", &PullOptions::default())
        .await
        .unwrap();

    let (save_streams, saved, _) = IoStreams::buffered(b"");
    ops::save(&src, &ctx, &save_streams, &["r.example.com/web:1".to_string()], &SaveOptions::default())
        .await
        .unwrap();

    let dst_dir = TempDir::new().unwrap();
    let dst = client(&dst_dir, &registry);
    let (streams, out, _) = IoStreams::buffered(&saved.contents());
    let opts = LoadOptions {
        quiet: true,
        ..Default::default()
    };
    ops::load(&dst, &dst.context(), &streams, &opts).await.unwrap();
    assert_eq!(out.text(), format!("{}\n", root.digest));
}

#[tokio::test]
async fn test_load_rejects_garbage() {
    let dir = TempDir::new().unwrap();
    let client = client(&dir, &MemoryRegistry::new());
    let (streams, _, _) = IoStreams::buffered(b"definitely not a tarball, but long enough to be read as one");
    let err = ops::load(&client, &client.context(), &streams, &LoadOptions::default())
        .await
        .unwrap_err();
    assert!(err.is(ErrorKind::InvalidArgument));
    assert!(client.images().list(&client.context(), &[]).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_import_rootfs_from_file() {
    let dir = TempDir::new().unwrap();
    let client = client(&dir, &MemoryRegistry::new());
    let ctx = client.context();
    let tarball = dir.path().join("rootfs.tar");
    std::fs::write(&tarball, layer(&[("etc/os-release", b"ID=test")])).unwrap();

    let (streams, _, _) = IoStreams::buffered(b"");
    let opts = ImportOptions {
        reference: Some("imported:1".to_string()),
        message: Some("from tarball".to_string()),
        platform: None,
    };
    let record = ops::import_rootfs(&client, &ctx, &streams, &ImportSource::File(tarball), &opts)
        .await
        .unwrap();
    assert_eq!(record.name, "docker.io/library/imported:1");

    let rows = ops::history(&client, &ctx, "imported:1", &cask_image::MatchComparer::all())
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].comment, "from tarball");
}
