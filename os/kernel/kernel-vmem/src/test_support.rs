//! Hosted RAM double for unit tests.

use crate::{FrameAlloc, PhysMapper};
use core::ptr::NonNull;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K};
use std::boxed::Box;
use std::sync::Mutex;
use std::vec::Vec;

const BASE: u64 = 0x0010_0000;

#[repr(C, align(4096))]
struct Aligned4K([u8; 4096]);

/// Fixed set of frames behind a mutex. Frames are zero-filled on free.
pub struct TestRam {
    frames: Box<[core::cell::UnsafeCell<Aligned4K>]>,
    free: Mutex<Vec<u64>>,
}

unsafe impl Sync for TestRam {}

impl TestRam {
    pub fn new(frames: usize) -> Self {
        let frames: Box<[_]> = (0..frames)
            .map(|_| core::cell::UnsafeCell::new(Aligned4K([0; 4096])))
            .collect();
        let free = (0..frames.len() as u64).rev().collect();
        Self {
            frames,
            free: Mutex::new(free),
        }
    }

    pub fn free_frames(&self) -> usize {
        self.free.lock().unwrap().len()
    }
}

impl FrameAlloc for TestRam {
    fn alloc_4k(&self) -> Option<PhysicalPage<Size4K>> {
        let index = self.free.lock().unwrap().pop()?;
        Some(PhysicalPage::from_addr(PhysicalAddress::new(BASE + index * 4096)))
    }

    fn free_4k(&self, page: PhysicalPage<Size4K>) {
        let index = (page.base().as_u64() - BASE) / 4096;
        unsafe { (*self.frames[index as usize].get()).0.fill(0) };
        let mut free = self.free.lock().unwrap();
        assert!(!free.contains(&index), "double free of {page:?}");
        free.push(index);
    }
}

impl PhysMapper for TestRam {
    unsafe fn phys_to_ptr<T>(&self, pa: PhysicalAddress) -> NonNull<T> {
        let offset = pa.as_u64() - BASE;
        let frame = &self.frames[(offset / 4096) as usize];
        let ptr = unsafe { frame.get().cast::<u8>().add((offset % 4096) as usize) };
        NonNull::new(ptr.cast()).unwrap()
    }
}
