#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

//! wgpu compute backend for the mining pipeline.
//!
//! Implements `PrimeEngine` on top of two WGSL kernels:
//! - `sieve.wgsl`: clears the batch bitmap and strikes composites, one
//!   sieving prime per thread (grid-strided) and one segment per workgroup
//!   row.
//! - `fermat.wgsl`: fixed 1024-bit Montgomery exponentiation, one candidate
//!   per thread.
//!
//! Host/device ownership is explicit: storage buffers live on the device for
//! the engine's lifetime, staging buffers are the only read path back, and
//! every transfer is a visible `copy_buffer_to_buffer` + map. The sieving
//! prime table itself is generated host-side (shared with the CPU reference
//! engine) and uploaded whenever the origin changes.

use std::sync::mpsc;

use engine_cpu::montgomery::FERMAT_BATCH_CAP;
use engine_cpu::sieve::{SegmentBitmap, SieveParams, SieveTable, SEGMENT_ROWS};
use engine_cpu::{EngineError, FermatOutcome, PrimeEngine};
use futures::executor::block_on;
use prime_core::wheel::WHEEL_RESIDUES;
use prime_core::{U1024, Wheel};

/// Maximum workgroups per dispatch dimension; the kernels grid-stride past
/// this.
const MAX_WORKGROUPS: u32 = 32_768;

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct SieveUniform {
    rows: u32,
    words_per_plane: u32,
    base_row_lo: u32,
    base_row_hi: u32,
    prime_count: u32,
    segment_rows: u32,
    _pad0: u32,
    _pad1: u32,
}

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct FermatUniform {
    count: u32,
    _pad0: u32,
    _pad1: u32,
    _pad2: u32,
}

struct GpuContext {
    device: wgpu::Device,
    queue: wgpu::Queue,

    clear_pipeline: wgpu::ComputePipeline,
    sieve_pipeline: wgpu::ComputePipeline,
    sieve_bind_group: wgpu::BindGroup,
    sieve_uniform: wgpu::Buffer,
    primes_buffer: wgpu::Buffer,
    bitmap_buffer: wgpu::Buffer,
    bitmap_staging: wgpu::Buffer,

    fermat_pipeline: wgpu::ComputePipeline,
    fermat_bind_group: wgpu::BindGroup,
    fermat_uniform: wgpu::Buffer,
    base_buffer: wgpu::Buffer,
    offsets_buffer: wgpu::Buffer,
    results_buffer: wgpu::Buffer,
    results_staging: wgpu::Buffer,
    stats_buffer: wgpu::Buffer,
    stats_staging: wgpu::Buffer,
}

/// One engine instance per claimed GPU device.
pub struct GpuEngine {
    table: SieveTable,
    origin: Option<U1024>,
    device_index: usize,
    ctx: GpuContext,
}

impl GpuEngine {
    /// Claims adapter `device_index`, compiles both kernels and allocates all
    /// device buffers. A missing device is a configuration error and fatal
    /// at startup.
    pub fn new(params: SieveParams, device_index: usize) -> Result<Self, EngineError> {
        let wheel = Wheel::new();
        let table = SieveTable::generate(&params);
        let ctx = block_on(Self::init(&params, &table, &wheel, device_index))?;
        log::info!(
            target: "miner",
            "GPU engine ready on device {device_index} ({} sieving primes, {} rows per batch)",
            table.len(),
            params.rows_per_batch
        );
        Ok(GpuEngine { table, origin: None, device_index, ctx })
    }

    pub fn device_index(&self) -> usize {
        self.device_index
    }

    pub fn params(&self) -> &SieveParams {
        self.table.params()
    }

    pub fn table(&self) -> &SieveTable {
        &self.table
    }

    async fn init(
        params: &SieveParams,
        table: &SieveTable,
        wheel: &Wheel,
        device_index: usize,
    ) -> Result<GpuContext, EngineError> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::PRIMARY,
            ..Default::default()
        });

        let adapters: Vec<_> = instance
            .enumerate_adapters(wgpu::Backends::PRIMARY)
            .into_iter()
            .collect();
        if adapters.is_empty() {
            return Err(EngineError::Config("no GPU adapters found".into()));
        }
        let adapter = adapters.into_iter().nth(device_index).ok_or_else(|| {
            EngineError::Config(format!("GPU device index {device_index} not present"))
        })?;
        let info = adapter.get_info();
        log::info!(
            target: "miner",
            "claiming GPU adapter {device_index}: {} (backend {:?})",
            info.name,
            info.backend
        );

        let primes_bytes = (table.len() * 16) as u64;
        let words_per_plane = params.rows_per_batch / 32;
        let bitmap_bytes = words_per_plane as u64 * WHEEL_RESIDUES as u64 * 4;

        let mut limits = wgpu::Limits::default();
        limits.max_storage_buffer_binding_size = limits
            .max_storage_buffer_binding_size
            .max(primes_bytes as u32)
            .max(bitmap_bytes as u32);
        limits.max_buffer_size = limits.max_buffer_size.max(primes_bytes).max(bitmap_bytes);

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("Prime Mining Device"),
                required_features: wgpu::Features::empty(),
                required_limits: limits,
                memory_hints: Default::default(),
                ..Default::default()
            })
            .await
            .map_err(|e| EngineError::Device(format!("request_device failed: {e:?}")))?;

        #[cfg(feature = "metrics")]
        {
            metrics::set_engine_backend(
                &format!("gpu-{device_index}"),
                &format!("{:?}", info.backend),
            );
        }

        // --- sieve pipelines -------------------------------------------------
        let sieve_shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Sieve Shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("sieve.wgsl").into()),
        });
        // Clear and strike passes share one bind group, so they need an
        // explicit common layout (auto layouts only see the bindings each
        // entry point touches).
        let storage_entry = |binding: u32, read_only: bool| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Storage { read_only },
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        };
        let sieve_bgl = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Sieve Bind Group Layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                storage_entry(1, true),
                storage_entry(2, true),
                storage_entry(3, false),
            ],
        });
        let sieve_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Sieve Pipeline Layout"),
            bind_group_layouts: &[&sieve_bgl],
            push_constant_ranges: &[],
        });
        let clear_pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("Sieve Clear Pipeline"),
            layout: Some(&sieve_layout),
            module: &sieve_shader,
            entry_point: Some("clear_main"),
            compilation_options: Default::default(),
            cache: None,
        });
        let sieve_pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("Sieve Pipeline"),
            layout: Some(&sieve_layout),
            module: &sieve_shader,
            entry_point: Some("sieve_main"),
            compilation_options: Default::default(),
            cache: None,
        });

        let sieve_uniform = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Sieve Params"),
            size: std::mem::size_of::<SieveUniform>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let primes_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Sieving Primes"),
            size: primes_bytes,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let residues_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Wheel Residues"),
            size: (WHEEL_RESIDUES * 4) as u64,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let bitmap_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Sieve Bitmap"),
            size: bitmap_bytes,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let bitmap_staging = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Sieve Bitmap Staging"),
            size: bitmap_bytes,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let residues: Vec<u32> = wheel.residues().to_vec();
        queue.write_buffer(&residues_buffer, 0, bytemuck::cast_slice(&residues));

        let sieve_bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Sieve Bind Group"),
            layout: &sieve_bgl,
            entries: &[
                wgpu::BindGroupEntry { binding: 0, resource: sieve_uniform.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 1, resource: primes_buffer.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 2, resource: residues_buffer.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 3, resource: bitmap_buffer.as_entire_binding() },
            ],
        });

        // --- fermat pipeline -------------------------------------------------
        let fermat_shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Fermat Shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("fermat.wgsl").into()),
        });
        let fermat_pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("Fermat Pipeline"),
            layout: None,
            module: &fermat_shader,
            entry_point: Some("fermat_main"),
            compilation_options: Default::default(),
            cache: None,
        });

        let fermat_uniform = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Fermat Params"),
            size: std::mem::size_of::<FermatUniform>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let base_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Fermat Base"),
            size: 128,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let offsets_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Fermat Offsets"),
            size: (FERMAT_BATCH_CAP * 8) as u64,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let results_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Fermat Results"),
            size: (FERMAT_BATCH_CAP * 4) as u64,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_SRC
                | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let results_staging = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Fermat Results Staging"),
            size: (FERMAT_BATCH_CAP * 4) as u64,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let stats_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Fermat Stats"),
            size: 8,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_SRC
                | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let stats_staging = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Fermat Stats Staging"),
            size: 8,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let fermat_bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Fermat Bind Group"),
            layout: &fermat_pipeline.get_bind_group_layout(0),
            entries: &[
                wgpu::BindGroupEntry { binding: 0, resource: fermat_uniform.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 1, resource: base_buffer.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 2, resource: offsets_buffer.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 3, resource: results_buffer.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 4, resource: stats_buffer.as_entire_binding() },
            ],
        });

        Ok(GpuContext {
            device,
            queue,
            clear_pipeline,
            sieve_pipeline,
            sieve_bind_group,
            sieve_uniform,
            primes_buffer,
            bitmap_buffer,
            bitmap_staging,
            fermat_pipeline,
            fermat_bind_group,
            fermat_uniform,
            base_buffer,
            offsets_buffer,
            results_buffer,
            results_staging,
            stats_buffer,
            stats_staging,
        })
    }

    /// Blocks until `staging` is mapped, copies its bytes out and unmaps.
    fn read_staging(&self, staging: &wgpu::Buffer, out: &mut [u8]) -> Result<(), EngineError> {
        let slice = staging.slice(..);
        let (tx, rx) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |res| {
            let _ = tx.send(res);
        });
        let _ = self.ctx.device.poll(wgpu::PollType::Wait);
        rx.recv()
            .map_err(|_| EngineError::Device("map callback dropped".into()))?
            .map_err(|e| EngineError::Device(format!("buffer map failed: {e:?}")))?;
        {
            let data = slice.get_mapped_range();
            out.copy_from_slice(&data);
        }
        staging.unmap();
        Ok(())
    }

    fn dispatch_fermat_chunk(
        &mut self,
        base_limbs: &[u32; 32],
        offsets: &[u64],
        results: &mut Vec<u8>,
    ) -> Result<(), EngineError> {
        let ctx = &self.ctx;
        let count = offsets.len() as u32;

        ctx.queue
            .write_buffer(&ctx.base_buffer, 0, bytemuck::cast_slice(base_limbs));
        let packed: Vec<[u32; 2]> = offsets
            .iter()
            .map(|&d| [d as u32, (d >> 32) as u32])
            .collect();
        ctx.queue
            .write_buffer(&ctx.offsets_buffer, 0, bytemuck::cast_slice(&packed));
        ctx.queue.write_buffer(
            &ctx.fermat_uniform,
            0,
            bytemuck::bytes_of(&FermatUniform { count, _pad0: 0, _pad1: 0, _pad2: 0 }),
        );

        let mut encoder = ctx
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: None });
        {
            let mut cpass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("fermat"),
                timestamp_writes: None,
            });
            cpass.set_pipeline(&ctx.fermat_pipeline);
            cpass.set_bind_group(0, &ctx.fermat_bind_group, &[]);
            cpass.dispatch_workgroups(count.div_ceil(64).min(MAX_WORKGROUPS), 1, 1);
        }
        encoder.copy_buffer_to_buffer(
            &ctx.results_buffer,
            0,
            &ctx.results_staging,
            0,
            count as u64 * 4,
        );
        ctx.queue.submit(Some(encoder.finish()));

        let mut raw = vec![0u8; count as usize * 4];
        {
            let slice = ctx.results_staging.slice(..count as u64 * 4);
            let (tx, rx) = mpsc::channel();
            slice.map_async(wgpu::MapMode::Read, move |res| {
                let _ = tx.send(res);
            });
            let _ = ctx.device.poll(wgpu::PollType::Wait);
            rx.recv()
                .map_err(|_| EngineError::Device("map callback dropped".into()))?
                .map_err(|e| EngineError::Device(format!("buffer map failed: {e:?}")))?;
            raw.copy_from_slice(&slice.get_mapped_range());
        }
        ctx.results_staging.unmap();

        let words: &[u32] = bytemuck::cast_slice(&raw);
        results.extend(words.iter().map(|&w| (w != 0) as u8));
        Ok(())
    }
}

impl PrimeEngine for GpuEngine {
    fn name(&self) -> &'static str {
        "gpu-wgpu"
    }

    fn set_origin(&mut self, origin: &U1024) -> Result<(), EngineError> {
        self.table.set_origin(origin)?;
        let packed: Vec<[u32; 4]> = self
            .table
            .primes()
            .iter()
            .map(|p| [p.q, p.winv, p.smodq, 0])
            .collect();
        self.ctx
            .queue
            .write_buffer(&self.ctx.primes_buffer, 0, bytemuck::cast_slice(&packed));
        self.origin = Some(*origin);
        Ok(())
    }

    fn sieve_batch(
        &mut self,
        base_row: u64,
        bitmap: &mut SegmentBitmap,
    ) -> Result<(), EngineError> {
        if self.origin.is_none() {
            return Err(EngineError::OriginNotSet);
        }
        let rows = self.table.params().rows_per_batch;
        if bitmap.rows() != rows {
            return Err(EngineError::Config(format!(
                "bitmap rows {} do not match batch rows {rows}",
                bitmap.rows()
            )));
        }
        let ctx = &self.ctx;
        let words_per_plane = rows / 32;
        let uniform = SieveUniform {
            rows,
            words_per_plane,
            base_row_lo: base_row as u32,
            base_row_hi: (base_row >> 32) as u32,
            prime_count: self.table.len() as u32,
            segment_rows: SEGMENT_ROWS,
            _pad0: 0,
            _pad1: 0,
        };
        ctx.queue
            .write_buffer(&ctx.sieve_uniform, 0, bytemuck::bytes_of(&uniform));

        let total_words = words_per_plane * WHEEL_RESIDUES as u32;
        let segments = rows.div_ceil(SEGMENT_ROWS);
        let prime_groups = (self.table.len() as u32).div_ceil(64).min(MAX_WORKGROUPS);

        let mut encoder = ctx
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: None });
        {
            let mut cpass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("sieve clear"),
                timestamp_writes: None,
            });
            cpass.set_pipeline(&ctx.clear_pipeline);
            cpass.set_bind_group(0, &ctx.sieve_bind_group, &[]);
            cpass.dispatch_workgroups(total_words.div_ceil(256), 1, 1);
        }
        {
            let mut cpass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("sieve strike"),
                timestamp_writes: None,
            });
            cpass.set_pipeline(&ctx.sieve_pipeline);
            cpass.set_bind_group(0, &ctx.sieve_bind_group, &[]);
            cpass.dispatch_workgroups(prime_groups, segments, 1);
        }
        let bitmap_bytes = total_words as u64 * 4;
        encoder.copy_buffer_to_buffer(&ctx.bitmap_buffer, 0, &ctx.bitmap_staging, 0, bitmap_bytes);
        ctx.queue.submit(Some(encoder.finish()));

        let dst: &mut [u8] = bytemuck::cast_slice_mut(bitmap.as_words_mut());
        self.read_staging(&self.ctx.bitmap_staging, dst)
    }

    fn fermat_batch(
        &mut self,
        base: &U1024,
        offsets: &[u64],
    ) -> Result<FermatOutcome, EngineError> {
        let base_le = base.to_little_endian();
        let mut base_limbs = [0u32; 32];
        for (i, limb) in base_limbs.iter_mut().enumerate() {
            *limb = u32::from_le_bytes(base_le[i * 4..(i + 1) * 4].try_into().expect("4 bytes"));
        }

        // Reset device counters for this logical batch.
        self.ctx
            .queue
            .write_buffer(&self.ctx.stats_buffer, 0, &[0u8; 8]);

        let mut results = Vec::with_capacity(offsets.len());
        for chunk in offsets.chunks(FERMAT_BATCH_CAP) {
            self.dispatch_fermat_chunk(&base_limbs, chunk, &mut results)?;
        }

        // Read back device-side (attempted, passed).
        let mut encoder = self
            .ctx
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: None });
        encoder.copy_buffer_to_buffer(&self.ctx.stats_buffer, 0, &self.ctx.stats_staging, 0, 8);
        self.ctx.queue.submit(Some(encoder.finish()));
        let mut stats_raw = [0u8; 8];
        self.read_staging(&self.ctx.stats_staging, &mut stats_raw)?;
        let attempted = u32::from_le_bytes(stats_raw[0..4].try_into().expect("4 bytes")) as u64;
        let passed = u32::from_le_bytes(stats_raw[4..8].try_into().expect("4 bytes")) as u64;

        if attempted != offsets.len() as u64 {
            return Err(EngineError::Device(format!(
                "device attempted {attempted} of {} submitted candidates",
                offsets.len()
            )));
        }
        Ok(FermatOutcome { results, attempted, passed })
    }
}
