//! upload pending assets once per digest and point the document at them

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;

use tracing::debug;

use crate::error::{Error, Result};
use crate::hash::Digest;
use crate::ops::progress::{CancelToken, Progress};
use crate::remote::{create_binary_blob, ObjectStore};
use crate::types::{AssetLayout, Document, ObjectId, PendingAsset, TreeEntry, UploadedObject};

/// how a document's records refer to assets
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AssetBinding {
    pub layout: AssetLayout,
    /// record field compared against an asset's logical key
    pub match_field: String,
    /// record field set to the uploaded asset's public path
    pub reference_field: String,
}

impl AssetBinding {
    /// binding where the reference field is also the one matched on
    pub fn in_place(layout: AssetLayout, field: impl Into<String>) -> Self {
        let field = field.into();
        Self {
            layout,
            match_field: field.clone(),
            reference_field: field,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct UploadOptions {
    /// uploads in flight at once; 0 and 1 both mean sequential
    pub concurrency: usize,
    pub cancel: Option<CancelToken>,
}

/// a document to commit together with the assets its records point at
#[derive(Clone, Debug)]
pub struct DocumentChange {
    pub document: Document,
    pub assets: Vec<PendingAsset>,
    pub binding: AssetBinding,
}

/// result of uploading the assets of one document
#[derive(Clone, Debug)]
pub struct UploadOutcome {
    /// the document with every uploaded reference rewritten
    pub document: Document,
    /// one entry per unique digest, in order of first appearance
    pub entries: Vec<TreeEntry>,
    pub uploaded: Vec<UploadedObject>,
}

/// result of uploading the assets of several documents together
#[derive(Clone, Debug)]
pub struct ChangesOutcome {
    /// rewritten documents, in input order
    pub documents: Vec<Document>,
    /// one entry per stored asset path, in order of first appearance
    pub entries: Vec<TreeEntry>,
    pub uploaded: Vec<UploadedObject>,
}

/// one distinct piece of content across all documents
struct Unique<'a> {
    digest: Digest,
    /// first asset carrying this content
    first: &'a PendingAsset,
}

/// one stored asset path: a unique content under one assets directory
struct Placement<'a> {
    /// index into the unique contents
    blob: usize,
    layout: &'a AssetLayout,
    /// taken from the first asset placed here
    extension: &'a str,
}

struct Batch<'a> {
    document: &'a Document,
    assets: &'a [PendingAsset],
    binding: &'a AssetBinding,
}

/// upload `assets` and rewrite `document` to reference them
///
/// content shared by several assets is uploaded once; every asset with that
/// content resolves to the same path. any upload failure aborts with the
/// failing asset's key and nothing is returned for the batch.
pub fn process(
    store: &dyn ObjectStore,
    document: &Document,
    assets: &[PendingAsset],
    binding: &AssetBinding,
    options: &UploadOptions,
    progress: &dyn Progress,
) -> Result<UploadOutcome> {
    let batch = Batch {
        document,
        assets,
        binding,
    };
    let mut outcome = process_batches(store, &[batch], options, progress)?;
    Ok(UploadOutcome {
        document: outcome.documents.remove(0),
        entries: outcome.entries,
        uploaded: outcome.uploaded,
    })
}

/// upload the assets of every change and rewrite each document
///
/// dedup spans all documents: each distinct content is uploaded once, and
/// assets of documents sharing an assets directory resolve to one path.
pub fn process_changes(
    store: &dyn ObjectStore,
    changes: &[DocumentChange],
    options: &UploadOptions,
    progress: &dyn Progress,
) -> Result<ChangesOutcome> {
    let batches: Vec<Batch<'_>> = changes
        .iter()
        .map(|c| Batch {
            document: &c.document,
            assets: &c.assets,
            binding: &c.binding,
        })
        .collect();
    process_batches(store, &batches, options, progress)
}

fn process_batches(
    store: &dyn ObjectStore,
    batches: &[Batch<'_>],
    options: &UploadOptions,
    progress: &dyn Progress,
) -> Result<ChangesOutcome> {
    let digests: Vec<Vec<Digest>> = batches
        .iter()
        .map(|b| b.assets.iter().map(PendingAsset::digest).collect())
        .collect();

    let mut blob_index: HashMap<Digest, usize> = HashMap::new();
    let mut uniques: Vec<Unique<'_>> = Vec::new();
    let mut place_index: HashMap<(&str, &str, Digest), usize> = HashMap::new();
    let mut placements: Vec<Placement<'_>> = Vec::new();
    // placement of every asset, per batch
    let mut slots: Vec<Vec<usize>> = Vec::with_capacity(batches.len());

    for (batch, batch_digests) in batches.iter().zip(&digests) {
        let layout = &batch.binding.layout;
        let mut batch_slots = Vec::with_capacity(batch.assets.len());
        for (asset, digest) in batch.assets.iter().zip(batch_digests) {
            let blob = *blob_index.entry(*digest).or_insert_with(|| {
                uniques.push(Unique {
                    digest: *digest,
                    first: asset,
                });
                uniques.len() - 1
            });
            let key = (
                layout.assets_root.as_str(),
                layout.category.as_str(),
                *digest,
            );
            let slot = *place_index.entry(key).or_insert_with(|| {
                placements.push(Placement {
                    blob,
                    layout,
                    extension: &asset.extension,
                });
                placements.len() - 1
            });
            batch_slots.push(slot);
        }
        slots.push(batch_slots);
    }

    debug!(
        assets = digests.iter().map(Vec::len).sum::<usize>(),
        unique = uniques.len(),
        paths = placements.len(),
        "uploading assets"
    );

    let shas = upload_all(store, &uniques, options)?;

    let mut uploaded = Vec::with_capacity(placements.len());
    let mut entries = Vec::with_capacity(placements.len());
    for placement in &placements {
        let d = &uniques[placement.blob].digest;
        let object = UploadedObject {
            path: placement.layout.repo_path(d, placement.extension),
            public_path: placement.layout.public_path(d, placement.extension),
            sha: shas[placement.blob].clone(),
        };
        entries.push(object.tree_entry()?);
        uploaded.push(object);
    }

    let mut announced = vec![false; placements.len()];
    let mut documents = Vec::with_capacity(batches.len());
    for (batch, batch_slots) in batches.iter().zip(&slots) {
        let mut document = batch.document.clone();
        for (asset, &slot) in batch.assets.iter().zip(batch_slots) {
            let public_path = &uploaded[slot].public_path;
            let n = document.rewrite_reference(
                &batch.binding.match_field,
                &asset.logical_key,
                &batch.binding.reference_field,
                public_path,
            );
            debug!(key = %asset.logical_key, path = %public_path, records = n, "rewrote references");

            progress.on_asset(&asset.logical_key, public_path, !announced[slot]);
            announced[slot] = true;
        }
        documents.push(document);
    }

    Ok(ChangesOutcome {
        documents,
        entries,
        uploaded,
    })
}

/// upload each unique piece of content, returning shas in input order
fn upload_all(
    store: &dyn ObjectStore,
    uniques: &[Unique<'_>],
    options: &UploadOptions,
) -> Result<Vec<ObjectId>> {
    let workers = options.concurrency.clamp(1, uniques.len().max(1));

    if workers == 1 {
        return uniques
            .iter()
            .map(|u| upload_one(store, u, options.cancel.as_ref()))
            .collect();
    }

    let next = AtomicUsize::new(0);
    let stop = AtomicBool::new(false);
    let mut results: Vec<Option<Result<ObjectId>>> = Vec::new();
    results.resize_with(uniques.len(), || None);

    let batches: Vec<Vec<(usize, Result<ObjectId>)>> = thread::scope(|s| {
        let handles: Vec<_> = (0..workers)
            .map(|_| {
                s.spawn(|| {
                    let mut done = Vec::new();
                    while !stop.load(Ordering::SeqCst) {
                        let i = next.fetch_add(1, Ordering::SeqCst);
                        let Some(unique) = uniques.get(i) else {
                            break;
                        };
                        let result = upload_one(store, unique, options.cancel.as_ref());
                        if result.is_err() {
                            stop.store(true, Ordering::SeqCst);
                        }
                        done.push((i, result));
                    }
                    done
                })
            })
            .collect();

        handles
            .into_iter()
            .map(|h| h.join().unwrap_or_else(|p| std::panic::resume_unwind(p)))
            .collect()
    });

    for (i, result) in batches.into_iter().flatten() {
        results[i] = Some(result);
    }

    // report the earliest failure in input order; work skipped after a
    // failure leaves holes, which only exist when some upload failed
    let mut shas = Vec::with_capacity(uniques.len());
    let mut first_err = None;
    for result in results {
        match result {
            Some(Ok(sha)) => shas.push(sha),
            Some(Err(e)) => {
                first_err.get_or_insert(e);
            }
            None => {}
        }
    }
    match first_err {
        Some(e) => Err(e),
        None => Ok(shas),
    }
}

fn upload_one(
    store: &dyn ObjectStore,
    unique: &Unique<'_>,
    cancel: Option<&CancelToken>,
) -> Result<ObjectId> {
    let key = &unique.first.logical_key;
    let wrap = |source: Error| Error::Upload {
        key: key.clone(),
        source: Box::new(source),
    };

    if cancel.is_some_and(CancelToken::is_cancelled) {
        return Err(wrap(Error::Cancelled));
    }

    let sha = create_binary_blob(store, &unique.first.content).map_err(wrap)?;
    debug!(%key, digest = %unique.digest, sha = %sha.short(), "uploaded asset");
    Ok(sha)
}
