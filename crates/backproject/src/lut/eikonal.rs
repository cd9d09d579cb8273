//! First-order fast-marching solver for `|grad T| = slowness` on a regular
//! 3-D node lattice. A 2-D problem is a lattice with a single node along y.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
	Far,
	Trial,
	Known,
}

#[derive(Debug, Clone, Copy)]
struct Trial {
	time: f64,
	index: usize,
}

impl PartialEq for Trial {
	fn eq(&self, other: &Self) -> bool {
		self.cmp(other) == Ordering::Equal
	}
}

impl Eq for Trial {}

impl Ord for Trial {
	// Reversed so the max-heap pops the earliest arrival first.
	fn cmp(&self, other: &Self) -> Ordering {
		other.time.total_cmp(&self.time).then_with(|| other.index.cmp(&self.index))
	}
}

impl PartialOrd for Trial {
	fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
		Some(self.cmp(other))
	}
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct FastMarching {
	dims: [usize; 3],
	spacing: [f64; 3],
}

impl FastMarching {
	pub(crate) const fn new(dims: [usize; 3], spacing: [f64; 3]) -> Self {
		Self { dims, spacing }
	}

	const fn len(&self) -> usize {
		self.dims[0] * self.dims[1] * self.dims[2]
	}

	const fn flat(&self, index: [usize; 3]) -> usize {
		(index[0] * self.dims[1] + index[1]) * self.dims[2] + index[2]
	}

	const fn unflatten(&self, flat: usize) -> [usize; 3] {
		let nz = self.dims[2];
		let ny = self.dims[1];
		[flat / (ny * nz), (flat / nz) % ny, flat % nz]
	}

	fn neighbour(&self, index: [usize; 3], axis: usize, forward: bool) -> Option<[usize; 3]> {
		let mut next = index;
		if forward {
			if index[axis] + 1 >= self.dims[axis] {
				return None;
			}
			next[axis] += 1;
		} else {
			next[axis] = index[axis].checked_sub(1)?;
		}
		Some(next)
	}

	/// Exact straight-ray times on the nodes bracketing a source at the
	/// fractional lattice position `source`, using the slowness found there.
	pub(crate) fn seeds_around(&self, source: [f64; 3], slowness: &[f64]) -> Vec<(usize, f64)> {
		let mut lower = [0; 3];
		let mut upper = [0; 3];
		for axis in 0..3 {
			let last = (self.dims[axis] - 1) as f64;
			let position = source[axis].clamp(0.0, last);
			lower[axis] = (position.floor() - 1.0).max(0.0) as usize;
			upper[axis] = (position.ceil() + 1.0).min(last) as usize;
		}

		let nearest = self.flat([
			source[0].round().clamp(0.0, (self.dims[0] - 1) as f64) as usize,
			source[1].round().clamp(0.0, (self.dims[1] - 1) as f64) as usize,
			source[2].round().clamp(0.0, (self.dims[2] - 1) as f64) as usize,
		]);
		let source_slowness = slowness[nearest];

		let mut seeds = Vec::new();
		for ix in lower[0]..=upper[0] {
			for iy in lower[1]..=upper[1] {
				for iz in lower[2]..=upper[2] {
					let dx = (ix as f64 - source[0]) * self.spacing[0];
					let dy = (iy as f64 - source[1]) * self.spacing[1];
					let dz = (iz as f64 - source[2]) * self.spacing[2];
					let distance = dz.mul_add(dz, dx.mul_add(dx, dy * dy)).sqrt();
					seeds.push((self.flat([ix, iy, iz]), distance * source_slowness));
				}
			}
		}
		seeds
	}

	pub(crate) fn solve(&self, slowness: &[f64], seeds: &[(usize, f64)]) -> Result<Vec<f64>, String> {
		let n = self.len();
		if slowness.len() != n {
			return Err(format!("slowness field has {} nodes, lattice has {n}", slowness.len()));
		}
		if let Some(bad) = slowness.iter().position(|s| !s.is_finite() || *s <= 0.0) {
			return Err(format!("non-positive or non-finite velocity at node {bad}"));
		}
		if seeds.is_empty() {
			return Err("no source nodes".to_string());
		}

		let mut time = vec![f64::INFINITY; n];
		let mut state = vec![State::Far; n];
		let mut heap = BinaryHeap::new();

		for &(index, t) in seeds {
			time[index] = time[index].min(t);
			state[index] = State::Known;
		}
		for &(index, _) in seeds {
			self.update_neighbours(index, slowness, &mut time, &mut state, &mut heap);
		}

		while let Some(Trial { time: t, index }) = heap.pop() {
			if state[index] == State::Known || t > time[index] {
				continue;
			}
			state[index] = State::Known;
			self.update_neighbours(index, slowness, &mut time, &mut state, &mut heap);
		}

		if let Some(bad) = time.iter().position(|t| !t.is_finite()) {
			return Err(format!("front never reached node {bad}"));
		}
		Ok(time)
	}

	fn update_neighbours(
		&self,
		index: usize,
		slowness: &[f64],
		time: &mut [f64],
		state: &mut [State],
		heap: &mut BinaryHeap<Trial>,
	) {
		let centre = self.unflatten(index);
		for axis in 0..3 {
			for forward in [false, true] {
				let Some(next) = self.neighbour(centre, axis, forward) else {
					continue;
				};
				let next_index = self.flat(next);
				if state[next_index] == State::Known {
					continue;
				}
				let t = self.local_update(next, slowness[next_index], time, state);
				if t < time[next_index] {
					time[next_index] = t;
					state[next_index] = State::Trial;
					heap.push(Trial { time: t, index: next_index });
				}
			}
		}
	}

	/// Upwind solution of `sum((T - a_k) / h_k)^2 = s^2` over the axes with a
	/// known neighbour, dropping the slowest axes while they would not be
	/// causal.
	fn local_update(&self, index: [usize; 3], slowness: f64, time: &[f64], state: &[State]) -> f64 {
		let mut terms: Vec<(f64, f64)> = Vec::with_capacity(3);
		for axis in 0..3 {
			let mut best = f64::INFINITY;
			for forward in [false, true] {
				if let Some(next) = self.neighbour(index, axis, forward) {
					let next_index = self.flat(next);
					if state[next_index] == State::Known {
						best = best.min(time[next_index]);
					}
				}
			}
			if best.is_finite() {
				terms.push((best, self.spacing[axis]));
			}
		}
		if terms.is_empty() {
			return f64::INFINITY;
		}
		terms.sort_by(|a, b| a.0.total_cmp(&b.0));

		let mut t = slowness.mul_add(terms[0].1, terms[0].0);
		for m in 2..=terms.len() {
			if t <= terms[m - 1].0 {
				break;
			}
			let (mut w_sum, mut aw_sum, mut aaw_sum) = (0.0, 0.0, 0.0);
			for &(a, h) in &terms[..m] {
				let w = 1.0 / (h * h);
				w_sum += w;
				aw_sum += a * w;
				aaw_sum += a * a * w;
			}
			let discriminant = aw_sum.mul_add(aw_sum, -w_sum * slowness.mul_add(-slowness, aaw_sum));
			if discriminant < 0.0 {
				break;
			}
			t = (aw_sum + discriminant.sqrt()) / w_sum;
		}
		t
	}
}
