mod consumers;
mod publishers;
