// ========================================================================================
//
//                       BATCH COLLATION AND PREFETCHING WORKERS
//
// ========================================================================================
//
// With `num_workers == 0` batches are encoded inline on the caller's thread. Otherwise a
// fixed set of scoped worker threads pull disjoint batch jobs from a shared queue and
// push encoded batches into a bounded channel. The channel bound is the prefetch window:
// once it is full, workers block until the training loop catches up.

use super::{EncodeError, EncodedPatient, PatientEncoder};
use crate::data::PatientRecord;
use crossbeam_channel::bounded;
use ndarray::Array2;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use std::collections::BTreeMap;
use std::thread;

/// Batches kept in flight per worker.
const PREFETCH_PER_WORKER: usize = 2;

/// A group of encoded patients and their label matrix.
#[derive(Debug, Clone)]
pub struct EncodedBatch {
    /// Position of this batch within its epoch.
    pub index: usize,
    pub patients: Vec<EncodedPatient>,
    /// `(patients, labels)`, 1.0 for a positive label.
    pub labels: Array2<f32>,
}

impl EncodedBatch {
    pub fn collate(index: usize, patients: Vec<EncodedPatient>) -> Self {
        let num_labels = patients.first().map_or(0, |p| p.labels.len());
        let labels = Array2::from_shape_fn((patients.len(), num_labels), |(i, j)| {
            if patients[i].labels[j] { 1.0 } else { 0.0 }
        });
        Self {
            index,
            patients,
            labels,
        }
    }

    pub fn len(&self) -> usize {
        self.patients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patients.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoaderConfig {
    pub batch_size: usize,
    pub num_workers: usize,
    pub shuffle: bool,
    /// When false, batches are handed over in completion order.
    pub preserve_order: bool,
    pub seed: u64,
}

pub struct BatchLoader<'a> {
    records: &'a [PatientRecord],
    encoder: &'a PatientEncoder<'a>,
    config: LoaderConfig,
    rng: StdRng,
}

fn encode_job(
    encoder: &PatientEncoder<'_>,
    records: &[PatientRecord],
    index: usize,
    members: &[usize],
) -> Result<EncodedBatch, EncodeError> {
    let patients = members
        .iter()
        .map(|&i| encoder.encode(&records[i]))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(EncodedBatch::collate(index, patients))
}

impl<'a> BatchLoader<'a> {
    pub fn new(
        records: &'a [PatientRecord],
        encoder: &'a PatientEncoder<'a>,
        config: LoaderConfig,
    ) -> Result<Self, EncodeError> {
        if config.batch_size == 0 {
            return Err(EncodeError::InvalidBatchSize);
        }
        Ok(Self {
            records,
            encoder,
            config,
            rng: StdRng::seed_from_u64(config.seed),
        })
    }

    pub fn num_patients(&self) -> usize {
        self.records.len()
    }

    pub fn num_batches(&self) -> usize {
        self.records.len().div_ceil(self.config.batch_size)
    }

    /// Batch jobs for one epoch, reshuffled every call when shuffling is on.
    fn jobs(&mut self) -> Vec<(usize, Vec<usize>)> {
        let mut order: Vec<usize> = (0..self.records.len()).collect();
        if self.config.shuffle {
            order.shuffle(&mut self.rng);
        }
        order
            .chunks(self.config.batch_size)
            .map(<[usize]>::to_vec)
            .enumerate()
            .collect()
    }

    /// Runs `f` once per batch of one epoch. The first error, from encoding or from
    /// `f`, stops the epoch and is returned.
    pub fn for_each_batch<F, E>(&mut self, mut f: F) -> Result<(), E>
    where
        F: FnMut(EncodedBatch) -> Result<(), E>,
        E: From<EncodeError>,
    {
        let jobs = self.jobs();
        let (encoder, records) = (self.encoder, self.records);

        if self.config.num_workers == 0 {
            for (index, members) in jobs {
                f(encode_job(encoder, records, index, &members)?)?;
            }
            return Ok(());
        }

        // More encoders than cores only adds contention.
        let num_workers = self.config.num_workers.min(num_cpus::get().max(1));
        let preserve_order = self.config.preserve_order;
        let num_jobs = jobs.len();

        thread::scope(|s| {
            let (job_tx, job_rx) = bounded::<(usize, Vec<usize>)>(num_jobs.max(1));
            for job in jobs {
                // The queue holds every job, so this never blocks.
                let _ = job_tx.send(job);
            }
            drop(job_tx);

            let (batch_tx, batch_rx) =
                bounded::<Result<EncodedBatch, EncodeError>>(PREFETCH_PER_WORKER * num_workers);

            let handles: Vec<_> = (0..num_workers)
                .map(|_| {
                    let job_rx = job_rx.clone();
                    let batch_tx = batch_tx.clone();
                    s.spawn(move || {
                        for (index, members) in job_rx {
                            let result = encode_job(encoder, records, index, &members);
                            // A closed channel means the consumer stopped early.
                            if batch_tx.send(result).is_err() {
                                break;
                            }
                        }
                    })
                })
                .collect();
            drop(batch_tx);

            let mut outcome: Result<(), E> = Ok(());
            let mut pending = BTreeMap::new();
            let mut next = 0;
            for result in batch_rx.iter() {
                let batch = match result {
                    Ok(batch) => batch,
                    Err(e) => {
                        outcome = Err(e.into());
                        break;
                    }
                };
                if !preserve_order {
                    if let Err(e) = f(batch) {
                        outcome = Err(e);
                        break;
                    }
                    continue;
                }
                pending.insert(batch.index, batch);
                while let Some(ready) = pending.remove(&next) {
                    next += 1;
                    if let Err(e) = f(ready) {
                        outcome = Err(e);
                        break;
                    }
                }
                if outcome.is_err() {
                    break;
                }
            }
            drop(batch_rx);

            let mut panicked = false;
            for handle in handles {
                panicked |= handle.join().is_err();
            }
            if panicked && outcome.is_ok() {
                return Err(EncodeError::WorkerPanicked.into());
            }
            outcome
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode::patient::tests::{sample_record, sample_vocabs};
    use crate::encode::{AgeSpan, Granularity};
    use crate::vocab::ExceptionLog;

    fn records(n: usize) -> Vec<PatientRecord> {
        (0..n)
            .map(|i| sample_record(&format!("p{i}"), i % 3 == 0))
            .collect()
    }

    fn config(num_workers: usize, shuffle: bool, preserve_order: bool) -> LoaderConfig {
        LoaderConfig {
            batch_size: 4,
            num_workers,
            shuffle,
            preserve_order,
            seed: 7,
        }
    }

    fn collect_ids(loader: &mut BatchLoader<'_>) -> Vec<Vec<String>> {
        let mut seen = Vec::new();
        loader
            .for_each_batch(|batch| {
                seen.push(batch.patients.iter().map(|p| p.id.clone()).collect());
                Ok::<(), EncodeError>(())
            })
            .unwrap();
        seen
    }

    #[test]
    fn collate_builds_label_matrix() {
        let vocabs = sample_vocabs();
        let log = ExceptionLog::disabled();
        let encoder =
            PatientEncoder::new(&vocabs, AgeSpan::new(0, 3, Granularity::Year).unwrap(), &log);
        let patients = records(3)
            .iter()
            .map(|r| encoder.encode(r).unwrap())
            .collect();
        let batch = EncodedBatch::collate(0, patients);
        assert_eq!(batch.labels.shape(), &[3, 1]);
        assert_eq!(batch.labels[[0, 0]], 1.0);
        assert_eq!(batch.labels[[1, 0]], 0.0);
    }

    #[test]
    fn inline_and_worker_loaders_agree_in_order() {
        let vocabs = sample_vocabs();
        let log = ExceptionLog::disabled();
        let encoder =
            PatientEncoder::new(&vocabs, AgeSpan::new(0, 3, Granularity::Year).unwrap(), &log);
        let data = records(10);

        let mut inline = BatchLoader::new(&data, &encoder, config(0, false, true)).unwrap();
        let mut pooled = BatchLoader::new(&data, &encoder, config(3, false, true)).unwrap();
        assert_eq!(inline.num_batches(), 3);

        let expected = collect_ids(&mut inline);
        assert_eq!(expected.len(), 3);
        assert_eq!(expected[2], vec!["p8", "p9"]);
        assert_eq!(collect_ids(&mut pooled), expected);
    }

    #[test]
    fn unordered_workers_cover_every_patient_once() {
        let vocabs = sample_vocabs();
        let log = ExceptionLog::disabled();
        let encoder =
            PatientEncoder::new(&vocabs, AgeSpan::new(0, 3, Granularity::Year).unwrap(), &log);
        let data = records(17);

        let mut loader = BatchLoader::new(&data, &encoder, config(4, true, false)).unwrap();
        let mut ids: Vec<String> = collect_ids(&mut loader).into_iter().flatten().collect();
        ids.sort();
        let mut expected: Vec<String> = data.iter().map(|r| r.id.clone()).collect();
        expected.sort();
        assert_eq!(ids, expected);
    }

    #[test]
    fn shuffling_is_seeded_and_changes_between_epochs() {
        let vocabs = sample_vocabs();
        let log = ExceptionLog::disabled();
        let encoder =
            PatientEncoder::new(&vocabs, AgeSpan::new(0, 3, Granularity::Year).unwrap(), &log);
        let data = records(40);

        let mut a = BatchLoader::new(&data, &encoder, config(0, true, true)).unwrap();
        let mut b = BatchLoader::new(&data, &encoder, config(2, true, true)).unwrap();
        let first = collect_ids(&mut a);
        assert_eq!(first, collect_ids(&mut b));
        assert_ne!(first, collect_ids(&mut a));
    }

    #[test]
    fn consumer_error_stops_the_epoch() {
        let vocabs = sample_vocabs();
        let log = ExceptionLog::disabled();
        let encoder =
            PatientEncoder::new(&vocabs, AgeSpan::new(0, 3, Granularity::Year).unwrap(), &log);
        let data = records(30);

        let mut loader = BatchLoader::new(&data, &encoder, config(2, false, true)).unwrap();
        let mut calls = 0;
        let result = loader.for_each_batch(|_| {
            calls += 1;
            if calls == 2 {
                Err(EncodeError::InvalidBatchSize)
            } else {
                Ok(())
            }
        });
        assert!(matches!(result, Err(EncodeError::InvalidBatchSize)));
        assert_eq!(calls, 2);
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let vocabs = sample_vocabs();
        let log = ExceptionLog::disabled();
        let encoder =
            PatientEncoder::new(&vocabs, AgeSpan::new(0, 3, Granularity::Year).unwrap(), &log);
        let mut cfg = config(0, false, true);
        cfg.batch_size = 0;
        assert!(matches!(
            BatchLoader::new(&[], &encoder, cfg),
            Err(EncodeError::InvalidBatchSize)
        ));
    }
}
