use std::collections::HashMap;

use courier_common::Channel;
use courier_config::ChannelsConfig;
use courier_store::ClaimedJob;

/// A group of claimed jobs sharing tenant and channel.
///
/// Batching controls claim fan-out only; every job in a batch is still
/// sent, rate-limited, and settled individually.
#[derive(Debug)]
pub struct JobBatch {
    pub tenant_id: String,
    pub channel: Channel,
    pub jobs: Vec<ClaimedJob>,
}

impl JobBatch {
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

/// Groups a claim result into (tenant, channel) batches, splitting any
/// group above the channel's batch cap. Due-date order within each
/// batch is preserved.
pub struct BatchAggregator {
    max_batch_sizes: HashMap<Channel, usize>,
}

impl BatchAggregator {
    pub fn new(max_batch_sizes: HashMap<Channel, usize>) -> Self {
        Self { max_batch_sizes }
    }

    pub fn from_channels(channels: &ChannelsConfig) -> Self {
        let mut sizes = HashMap::new();
        for channel in Channel::all() {
            sizes.insert(channel, channels.for_channel(channel).max_batch_size);
        }
        Self::new(sizes)
    }

    pub fn group(&self, claimed: Vec<ClaimedJob>) -> Vec<JobBatch> {
        let mut order: Vec<(String, Channel)> = Vec::new();
        let mut groups: HashMap<(String, Channel), Vec<ClaimedJob>> = HashMap::new();

        for item in claimed {
            let key = (item.job.tenant_id.clone(), item.job.channel());
            if !groups.contains_key(&key) {
                order.push(key.clone());
            }
            groups.entry(key).or_default().push(item);
        }

        let mut batches = Vec::new();
        for key in order {
            let (tenant_id, channel) = key.clone();
            let jobs = match groups.remove(&key) {
                Some(jobs) => jobs,
                None => continue,
            };
            let cap = self.max_batch_sizes.get(&channel).copied().unwrap_or(50).max(1);

            let mut jobs = jobs;
            while !jobs.is_empty() {
                let rest = if jobs.len() > cap {
                    jobs.split_off(cap)
                } else {
                    Vec::new()
                };
                batches.push(JobBatch {
                    tenant_id: tenant_id.clone(),
                    channel,
                    jobs: std::mem::replace(&mut jobs, rest),
                });
            }
        }
        batches
    }
}
