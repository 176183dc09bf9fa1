use std::alloc::{GlobalAlloc, Layout};

use segalloc::SegAlloc;

fn print_alloc(address: *mut u8, layout: Layout) {
    println!(
        "\nAlloc of size {} and alignment {} at {address:?}",
        layout.size(),
        layout.align()
    );
    println!(
        "Alignment check: {address:?} % {} = {}",
        layout.align(),
        address as usize % layout.align()
    );
}

fn main() {
    let allocator = SegAlloc::new();

    unsafe {
        let layouts = [16, 32, 1024, 4096].map(|align| Layout::from_size_align(1, align).unwrap());
        let addresses = layouts.map(|layout| {
            let address = allocator.alloc(layout);
            print_alloc(address, layout);
            address
        });

        for (address, layout) in addresses.into_iter().zip(layouts) {
            allocator.dealloc(address, layout);
        }
    }

    let stats = allocator.check_heap().unwrap();
    println!("\nFree blocks after deallocating everything: {}", stats.free_blocks);
}
