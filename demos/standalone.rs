use std::ptr::NonNull;

use segalloc::{Config, Heap};

fn print_alloc(size: usize, address: NonNull<u8>, heap: &Heap) {
    println!("Requested {size} bytes of memory");
    println!("Received this address: {address:?}");
    println!("Usable size: {}", unsafe { heap.usable_size(address) });
}

fn print_stats(heap: &Heap) {
    let stats = heap.check_heap().unwrap();
    println!(
        "Heap: {} bytes, {} blocks, {} free blocks with {} free bytes\n",
        stats.heap_size, stats.blocks, stats.free_blocks, stats.free_bytes
    );
}

fn main() {
    let mut heap = Heap::with_config(Config::new().with_arena_capacity(1 << 20));

    unsafe {
        let addr1 = heap.allocate(1).unwrap().unwrap();
        print_alloc(1, addr1, &heap);

        let addr2 = heap.allocate(1024).unwrap().unwrap();
        print_alloc(1024, addr2, &heap);

        let addr3 = heap.allocate(4096).unwrap().unwrap();
        print_alloc(4096, addr3, &heap);

        print_stats(&heap);

        println!("Deallocating the middle block...");
        heap.deallocate(addr2.as_ptr()).unwrap();
        print_stats(&heap);

        println!("Allocating 512 bytes, they should land where the middle block was");
        let addr4 = heap.allocate(512).unwrap().unwrap();
        print_alloc(512, addr4, &heap);

        println!("\nNow let's try some reallocs");
        let count = 10;
        let mut numbers = heap.zero_allocate(count, 4).unwrap().unwrap().cast::<u32>();
        for i in 0..count {
            *numbers.as_ptr().add(i) = i as u32;
        }

        for size in [40, 400, 4000] {
            numbers = heap
                .reallocate(numbers.as_ptr().cast(), size * 4)
                .unwrap()
                .unwrap()
                .cast();
            println!("Room for {size} numbers at {numbers:?}");
        }

        let first = std::slice::from_raw_parts(numbers.as_ptr(), count);
        println!("First {count} numbers survived: {first:?}\n");

        println!("Deallocating everything...");
        for address in [addr1.as_ptr(), addr3.as_ptr(), addr4.as_ptr(), numbers.as_ptr().cast()] {
            heap.deallocate(address).unwrap();
        }

        print_stats(&heap);
    }
}
